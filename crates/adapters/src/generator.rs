use std::collections::BTreeMap;
use std::time::Duration;

use log::{debug, warn};
use reqwest::blocking::Client;
use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};

use fablesmith_core::config::{Config, LlmConfig, ModelRoles};
use fablesmith_core::generation::{GenerationError, TextGenerator};

use crate::base_url::{check_base_url, ollama_base_url};
use crate::error::AdapterError;
use crate::retry::{call_with_retry, RetryConfig};

const RETRY_SLEEP: Duration = Duration::from_secs(2);

/// One configured model endpoint.
trait Backend: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, AdapterError>;
}

/// Routes `generate(prompt, model)` to the backend of the profile named
/// `model`.
pub struct ProfileTextGenerator {
    backends: BTreeMap<String, Box<dyn Backend>>,
}

impl ProfileTextGenerator {
    /// Builds backends for the named profiles only, so a broken profile that
    /// the run does not use cannot stop it.
    pub fn from_profiles<'n, I>(config: &Config, names: I) -> Result<Self, AdapterError>
    where
        I: IntoIterator<Item = &'n str>,
    {
        let mut backends = BTreeMap::new();
        for name in names {
            if backends.contains_key(name) {
                continue;
            }
            let profile = config
                .get_llm_profile(name)
                .ok_or_else(|| AdapterError::UnknownProfile(name.to_string()))?;
            backends.insert(name.to_string(), create_backend(profile)?);
        }
        Ok(Self { backends })
    }

    pub fn profiles(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    pub fn complete(&self, profile: &str, prompt: &str) -> Result<String, AdapterError> {
        let backend = self
            .backends
            .get(profile)
            .ok_or_else(|| AdapterError::UnknownProfile(profile.to_string()))?;
        debug!("sending {} prompt bytes to profile `{}`", prompt.len(), profile);
        backend.complete(prompt)
    }
}

impl TextGenerator for ProfileTextGenerator {
    fn generate(&self, prompt: &str, model: &str) -> Result<String, GenerationError> {
        if !self.backends.contains_key(model) {
            return Err(GenerationError::unknown_model(model));
        }
        self.complete(model, prompt).map_err(GenerationError::new)
    }
}

/// Generator serving every role named in `roles`.
pub fn create_text_generator(
    config: &Config,
    roles: &ModelRoles,
) -> Result<ProfileTextGenerator, AdapterError> {
    ProfileTextGenerator::from_profiles(config, roles.iter().map(|(_, profile)| profile))
}

fn create_backend(profile: &LlmConfig) -> Result<Box<dyn Backend>, AdapterError> {
    let fmt = profile.interface_format.trim().to_lowercase();
    let settings = RequestSettings::from_profile(profile);

    match fmt.as_str() {
        "ollama" => Ok(Box::new(OllamaBackend::new(
            resolve(&profile.base_url, "http://localhost:11434", ollama_base_url),
            profile.model_name.clone(),
            settings,
        )?)),
        "openai" | "" => Ok(Box::new(OpenAiLikeBackend::new(
            resolve(&profile.base_url, "https://api.openai.com/v1", check_base_url),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            settings,
        )?)),
        "deepseek" => Ok(Box::new(OpenAiLikeBackend::new(
            resolve(&profile.base_url, "https://api.deepseek.com/v1", check_base_url),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            settings,
        )?)),
        "lm studio" => Ok(Box::new(OpenAiLikeBackend::new(
            resolve(&profile.base_url, "http://localhost:1234/v1", check_base_url),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            settings,
        )?)),
        "grok" => Ok(Box::new(OpenAiLikeBackend::new(
            resolve(&profile.base_url, "https://api.x.ai/v1", check_base_url),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            settings,
        )?)),
        other => Err(AdapterError::InvalidConfig(format!(
            "unknown interface_format: {}",
            other
        ))),
    }
}

fn optional_string(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn resolve(base_url: &str, default: &str, normalize: fn(&str) -> String) -> String {
    if base_url.trim().is_empty() {
        normalize(default)
    } else {
        normalize(base_url)
    }
}

#[derive(Clone, Copy, Debug)]
struct RequestSettings {
    temperature: f32,
    max_tokens: Option<u32>,
    timeout: Duration,
    retry: RetryConfig,
}

impl RequestSettings {
    fn from_profile(profile: &LlmConfig) -> Self {
        Self {
            temperature: profile.temperature,
            max_tokens: if profile.max_tokens == 0 {
                None
            } else {
                Some(profile.max_tokens)
            },
            timeout: Duration::from_secs(profile.timeout.max(1)),
            retry: RetryConfig::new(profile.max_retries.max(1), RETRY_SLEEP),
        }
    }

    fn client(&self) -> Result<Client, AdapterError> {
        Ok(Client::builder().timeout(self.timeout).build()?)
    }
}

fn require_model(model_name: &str) -> Result<(), AdapterError> {
    if model_name.trim().is_empty() {
        return Err(AdapterError::InvalidConfig(
            "model_name must not be empty".to_string(),
        ));
    }
    Ok(())
}

struct OpenAiLikeBackend {
    client: Client,
    url: String,
    api_key: Option<String>,
    model_name: String,
    settings: RequestSettings,
}

impl OpenAiLikeBackend {
    fn new(
        base_url: String,
        api_key: Option<String>,
        model_name: String,
        settings: RequestSettings,
    ) -> Result<Self, AdapterError> {
        if base_url.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "base_url must not be empty".to_string(),
            ));
        }
        require_model(&model_name)?;

        Ok(Self {
            client: settings.client()?,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model_name,
            settings,
        })
    }

    fn complete_once(&self, prompt: &str) -> Result<String, AdapterError> {
        let body = ChatCompletionRequest {
            model: &self.model_name,
            messages: vec![ChatMessageRequest {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.settings.max_tokens,
            temperature: Some(self.settings.temperature),
        };

        let mut request = self.client.post(&self.url).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(key) = self.api_key.as_deref().filter(|key| !key.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.json(&body).send()?;
        let parsed: ChatCompletionResponse = read_json(response)?;
        extract_choice_content(parsed).ok_or(AdapterError::EmptyResponse)
    }
}

impl Backend for OpenAiLikeBackend {
    fn complete(&self, prompt: &str) -> Result<String, AdapterError> {
        call_with_retry(|| self.complete_once(prompt), &self.settings.retry)
    }
}

struct OllamaBackend {
    client: Client,
    url: String,
    model_name: String,
    settings: RequestSettings,
}

impl OllamaBackend {
    fn new(
        base_url: String,
        model_name: String,
        settings: RequestSettings,
    ) -> Result<Self, AdapterError> {
        require_model(&model_name)?;
        Ok(Self {
            client: settings.client()?,
            url: format!("{}/api/generate", base_url),
            model_name,
            settings,
        })
    }

    fn complete_once(&self, prompt: &str) -> Result<String, AdapterError> {
        let body = OllamaGenerateRequest {
            model: &self.model_name,
            prompt,
            stream: false,
            options: OllamaOptions {
                temperature: self.settings.temperature,
                num_predict: self.settings.max_tokens,
            },
        };

        let response = self.client.post(&self.url).json(&body).send()?;
        let parsed: OllamaGenerateResponse = read_json(response)?;
        extract_ollama_content(parsed)
    }
}

impl Backend for OllamaBackend {
    fn complete(&self, prompt: &str) -> Result<String, AdapterError> {
        call_with_retry(|| self.complete_once(prompt), &self.settings.retry)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::blocking::Response,
) -> Result<T, AdapterError> {
    let status = response.status();
    let body = response.text()?;
    if !status.is_success() {
        return Err(AdapterError::HttpStatus { status, body });
    }
    Ok(serde_json::from_str(&body)?)
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

fn extract_choice_content(response: ChatCompletionResponse) -> Option<String> {
    response.choices.into_iter().find_map(|choice| {
        choice
            .message
            .and_then(|message| message.content)
            .filter(|content| !content.trim().is_empty())
            .or_else(|| choice.text.filter(|text| !text.trim().is_empty()))
    })
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
}

fn extract_ollama_content(response: OllamaGenerateResponse) -> Result<String, AdapterError> {
    if !response.done {
        warn!("Ollama returned an unfinished response");
    }
    if response.done_reason.as_deref() == Some("length") {
        warn!("Ollama response truncated by num_predict");
    }
    if response.response.trim().is_empty() {
        return Err(AdapterError::EmptyResponse);
    }
    Ok(response.response)
}
