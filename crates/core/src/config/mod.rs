use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_MAX_CHAPTER_ATTEMPTS: usize = 3;
pub const DEFAULT_OUTPUT_DIR: &str = "books";
pub const DEFAULT_THEME: &str = "Create a fantasy story set in a completely original world, \
with an unusual protagonist, magical creatures and a culture unlike any seen before.";

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout() -> u64 {
    600
}

fn default_max_retries() -> usize {
    1
}

fn default_max_chapter_attempts() -> usize {
    DEFAULT_MAX_CHAPTER_ATTEMPTS
}

fn default_output_dir() -> String {
    DEFAULT_OUTPUT_DIR.to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Connection settings for one model served by one backend.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub interface_format: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Transport-level attempts per call. The chapter loop has its own bound,
    /// so this stays at one unless a flaky backend needs it.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            interface_format: String::new(),
            model_name: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmConfig {
    pub fn ollama(model_name: impl Into<String>) -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            interface_format: "ollama".to_string(),
            model_name: model_name.into(),
            ..Self::default()
        }
    }
}

/// Which LLM profile serves each role in the pipeline.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRoles {
    /// Ideas, synopsis, structure, drafts and final chapters.
    #[serde(default)]
    pub creative: String,
    /// The informational quality report.
    #[serde(default)]
    pub quality: String,
    /// Yes/no verdicts for the book gate and chapter drafts.
    #[serde(default)]
    pub verifier: String,
}

impl ModelRoles {
    pub fn new(
        creative: impl Into<String>,
        quality: impl Into<String>,
        verifier: impl Into<String>,
    ) -> Self {
        Self {
            creative: creative.into(),
            quality: quality.into(),
            verifier: verifier.into(),
        }
    }

    /// Every role served by the same profile.
    pub fn uniform(profile: impl Into<String>) -> Self {
        let profile = profile.into();
        Self::new(profile.clone(), profile.clone(), profile)
    }

    /// Fills unset roles with `fallback`.
    pub fn with_fallback(&self, fallback: &str) -> Self {
        let pick = |value: &str| {
            if value.trim().is_empty() {
                fallback.to_string()
            } else {
                value.trim().to_string()
            }
        };
        Self {
            creative: pick(&self.creative),
            quality: pick(&self.quality),
            verifier: pick(&self.verifier),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("creative", self.creative.as_str()),
            ("quality", self.quality.as_str()),
            ("verifier", self.verifier.as_str()),
        ]
        .into_iter()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BookConfig {
    #[serde(default)]
    pub theme: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_max_chapter_attempts")]
    pub max_chapter_attempts: usize,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            theme: String::new(),
            output_dir: default_output_dir(),
            max_chapter_attempts: default_max_chapter_attempts(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptConfig {
    #[serde(default)]
    pub custom_directories: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RecentUsage {
    #[serde(default)]
    pub last_llm_profile: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub llm_profiles: BTreeMap<String, LlmConfig>,
    #[serde(default)]
    pub models: ModelRoles,
    #[serde(default)]
    pub book: BookConfig,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub recent: RecentUsage,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local Ollama setup: a reasoning model for creative work and a small
    /// model for reviews and verdicts.
    pub fn starter() -> Self {
        let mut config = Self::default();
        config.upsert_llm_profile("creative", LlmConfig::ollama("deepseek-r1:1.5b"));
        config.upsert_llm_profile("quality", LlmConfig::ollama("gemma3:1b"));
        config.upsert_llm_profile("verifier", LlmConfig::ollama("gemma3:1b"));
        config.models = ModelRoles::new("creative", "quality", "verifier");
        config.book.theme = DEFAULT_THEME.to_string();
        config
    }

    pub fn get_llm_profile(&self, name: &str) -> Option<&LlmConfig> {
        self.llm_profiles.get(name)
    }

    pub fn upsert_llm_profile<S: Into<String>>(&mut self, name: S, profile: LlmConfig) {
        self.llm_profiles.insert(name.into(), profile);
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            Config::from_path(&path)?
        } else {
            Config::default()
        };

        Ok(Self { path, config })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn replace(&mut self, config: Config) {
        self.config = config;
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.to_path(&self.path)
    }

    pub fn touch_llm_profile<S: Into<String>>(&mut self, name: S) {
        self.config.recent.last_llm_profile = Some(name.into());
    }

    /// The most recently used profile, if it still exists.
    pub fn last_llm_profile(&self) -> Option<&str> {
        self.config
            .recent
            .last_llm_profile
            .as_deref()
            .filter(|name| self.config.llm_profiles.contains_key(*name))
    }

    /// Role assignments with empty roles filled from the last used profile or
    /// else the first configured one.
    pub fn resolved_roles(&self) -> Option<ModelRoles> {
        let fallback = self
            .last_llm_profile()
            .map(str::to_string)
            .or_else(|| self.config.llm_profiles.keys().next().cloned())?;
        Some(self.config.models.with_fallback(&fallback))
    }
}
