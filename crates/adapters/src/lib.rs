mod base_url;
mod error;
mod generator;
mod retry;

pub use base_url::{check_base_url, ollama_base_url};
pub use error::AdapterError;
pub use generator::{create_text_generator, ProfileTextGenerator};
pub use retry::{call_with_retry, RetryConfig};

pub use fablesmith_core::config::{Config, ConfigStore, LlmConfig, ModelRoles};
pub use fablesmith_core::generation::{GenerationError, TextGenerator};
