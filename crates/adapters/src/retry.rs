use std::thread;
use std::time::Duration;

use log::warn;

use crate::error::AdapterError;

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub sleep: Duration,
}

impl RetryConfig {
    pub const fn new(max_retries: usize, sleep: Duration) -> Self {
        Self { max_retries, sleep }
    }

    /// A single attempt, no waiting.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            sleep: Duration::from_secs(2),
        }
    }
}

pub fn call_with_retry<F, T>(mut f: F, config: &RetryConfig) -> Result<T, AdapterError>
where
    F: FnMut() -> Result<T, AdapterError>,
{
    let max_retries = config.max_retries.max(1);
    let mut last_error: Option<AdapterError> = None;

    for attempt in 1..=max_retries {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if max_retries == 1 || !err.is_retryable() {
                    return Err(err);
                }
                warn!(
                    "[call_with_retry] attempt {}/{} failed: {}",
                    attempt, max_retries, err
                );
                if attempt < max_retries {
                    thread::sleep(config.sleep);
                }
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or(AdapterError::EmptyResponse);
    Err(AdapterError::retry_exhausted(max_retries, err))
}
