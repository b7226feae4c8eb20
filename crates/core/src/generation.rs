use std::error::Error as StdError;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Opaque failure of a text-generation backend: unavailable, timed out,
/// rejected the request or answered with nothing usable.
#[derive(Debug)]
pub struct GenerationError {
    inner: Box<dyn StdError + Send + Sync>,
}

impl GenerationError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Box::new(error),
        }
    }

    pub fn empty_response() -> Self {
        Self::new(EmptyResponse)
    }

    pub fn unknown_model(model: &str) -> Self {
        Self::new(UnknownModel(model.to_string()))
    }

    pub fn is_empty_response(&self) -> bool {
        self.inner.is::<EmptyResponse>()
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl StdError for GenerationError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("backend returned an empty response")]
struct EmptyResponse;

#[derive(Debug, thiserror::Error)]
#[error("no model profile named `{0}`")]
struct UnknownModel(String);

/// Blocking text-generation capability. `model` names the model profile that
/// should serve the request.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, model: &str) -> Result<String, GenerationError>;
}

impl<T: TextGenerator + ?Sized> TextGenerator for Box<T> {
    fn generate(&self, prompt: &str, model: &str) -> Result<String, GenerationError> {
        (**self).generate(prompt, model)
    }
}

impl<T: TextGenerator + ?Sized> TextGenerator for &T {
    fn generate(&self, prompt: &str, model: &str) -> Result<String, GenerationError> {
        (**self).generate(prompt, model)
    }
}

/// Strips code fences and `<think>` reasoning blocks, then trims.
pub fn clean_response(raw: &str) -> String {
    think_regex()
        .replace_all(raw, "")
        .replace("```", "")
        .trim()
        .to_string()
}

/// Calls the generator and cleans the answer. An answer that is empty after
/// cleaning is reported as a failure.
pub fn generate_cleaned<G: TextGenerator + ?Sized>(
    generator: &G,
    prompt: &str,
    model: &str,
) -> Result<String, GenerationError> {
    let raw = generator.generate(prompt, model)?;
    let cleaned = clean_response(&raw);
    if cleaned.is_empty() {
        return Err(GenerationError::empty_response());
    }
    Ok(cleaned)
}

fn think_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("invalid think regex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct Echo;

    impl TextGenerator for Echo {
        fn generate(&self, prompt: &str, _model: &str) -> Result<String, GenerationError> {
            Ok(prompt.to_string())
        }
    }

    #[test]
    fn clean_response_removes_reasoning_and_fences() {
        let raw = "<think>\nmaybe yes, maybe no\n</think>\n```\nNO\n```\n";
        assert_eq!(clean_response(raw), "NO");
    }

    #[test]
    fn generate_cleaned_rejects_blank_answers() {
        let err = generate_cleaned(&Echo, "  ```  ", "creative").expect_err("blank");
        assert!(err.is_empty_response());
    }

    #[test]
    fn boxed_generators_forward_calls() {
        let boxed: Box<dyn TextGenerator> = Box::new(Echo);
        assert_eq!(boxed.generate("hello", "m").unwrap(), "hello");
    }

    #[test]
    fn error_exposes_inner_source() {
        let err = GenerationError::new(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
        assert_eq!(err.to_string(), "timed out");
        assert!(!err.is_empty_response());
    }
}
