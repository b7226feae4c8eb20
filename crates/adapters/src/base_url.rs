use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/v\d+$").unwrap());
static OLLAMA_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/(v1|api)/?$").unwrap());

/// Normalizes an OpenAI-compatible base URL so that it ends with a version
/// segment. A trailing `#` opts out of the rewrite.
pub fn check_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if trimmed.ends_with('#') {
        return trimmed.trim_end_matches('#').to_string();
    }

    if !VERSION_SUFFIX_RE.is_match(trimmed) && !trimmed.contains("/v1") {
        let without_slash = trimmed.trim_end_matches('/');
        format!("{}/v1", without_slash)
    } else {
        trimmed.to_string()
    }
}

/// Root URL of an Ollama server; the native API lives under `/api`.
pub fn ollama_base_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    OLLAMA_SUFFIX_RE
        .replace(trimmed, "")
        .trim_end_matches('/')
        .to_string()
}
