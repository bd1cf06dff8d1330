use std::time::Duration;

use crate::{backoff::ExponentialBackoff, RetryConfig, DEFAULT_MAX_BODY_BYTES};

/// Configures HTTP timeout, retry and body size behavior.
///
/// These are client-wide defaults; [`RequestMetadata`](crate::RequestMetadata)
/// overrides them per request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Per-attempt timeout for the response head in milliseconds.
    pub timeout_ms: u64,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base retry backoff in milliseconds (exponential strategy).
    pub retry_backoff_ms: u64,
    /// Cap used when a response body has to be buffered.
    pub max_body_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 0,
            retry_backoff_ms: 250,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ClientOptions {
    /// Reads options from the environment, keeping defaults for unset keys.
    ///
    /// Reads:
    /// - `KVARTO_HTTP_TIMEOUT_MS`
    /// - `KVARTO_HTTP_MAX_RETRIES`
    /// - `KVARTO_HTTP_RETRY_BACKOFF_MS`
    /// - `KVARTO_HTTP_MAX_BODY_BYTES`
    ///
    /// Returns an error if a variable is set but not a number.
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> std::result::Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();
        if let Some(value) = parse_var(&lookup, "KVARTO_HTTP_TIMEOUT_MS")? {
            options.timeout_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "KVARTO_HTTP_MAX_RETRIES")? {
            options.max_retries = value;
        }
        if let Some(value) = parse_var(&lookup, "KVARTO_HTTP_RETRY_BACKOFF_MS")? {
            options.retry_backoff_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "KVARTO_HTTP_MAX_BODY_BYTES")? {
            options.max_body_bytes = value;
        }
        Ok(options)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Retry policy used when a request does not carry its own: exponential
    /// backoff doubling from `retry_backoff_ms`.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries).with_backoff(ExponentialBackoff::new(
            Duration::from_millis(self.retry_backoff_ms),
            2,
        ))
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> std::result::Result<Option<T>, String>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{key} must be a non-negative integer, got '{raw}'")),
    }
}
