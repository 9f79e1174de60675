use std::time::Duration;

use crate::{UploadError, UploadResult};

/// Configuration for upload pipelines
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Largest slice of file bytes written in one go (bounds memory per upload)
    pub chunk_size: usize,

    /// Admission gate size: pipelines allowed to run at the same time
    pub max_concurrent_transfers: usize,

    /// Absolute max size accepted for a single file (safety guard)
    pub max_file_bytes: u64,

    /// How many times a pipeline may ask for a fresh grant after expiry
    pub max_replans: u32,

    /// A chunk write that takes longer than this counts as a transient failure
    pub chunk_timeout: Duration,

    /// File names that are never uploaded
    pub ignored_file_names: Vec<String>,

    /// Retry behaviour for transient transfer failures
    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024, // 256KB
            max_concurrent_transfers: 4,
            max_file_bytes: 5 * 1024 * 1024 * 1024, // 5GB
            max_replans: 2,
            chunk_timeout: Duration::from_secs(30),
            ignored_file_names: vec![".DS_Store".to_string()],
            retry: RetryPolicy::default(),
        }
    }
}

/// Bounded exponential backoff for retries on the same grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = max_retries + 1
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_max_concurrent_transfers(mut self, max: usize) -> Self {
        self.max_concurrent_transfers = max;
        self
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn with_max_replans(mut self, max: u32) -> Self {
        self.max_replans = max;
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn ignore_file_name<S: Into<String>>(mut self, name: S) -> Self {
        self.ignored_file_names.push(name.into());
        self
    }

    pub fn is_ignored(&self, file_name: &str) -> bool {
        self.ignored_file_names
            .iter()
            .any(|ignored| file_name == ignored || file_name.ends_with(&format!("/{}", ignored)))
    }

    pub fn validate(&self) -> UploadResult<()> {
        if self.chunk_size == 0 {
            return Err(UploadError::configuration("chunk_size must be greater than 0"));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(UploadError::configuration(
                "max_concurrent_transfers must be greater than 0",
            ));
        }
        if self.retry.base_backoff > self.retry.max_backoff {
            return Err(UploadError::configuration(
                "retry base_backoff must not exceed max_backoff",
            ));
        }
        Ok(())
    }

    /// Load overrides from the process environment.
    ///
    /// `UploadConfig::from_env("DOG_UPLOAD")` reads `DOG_UPLOAD__CHUNK_SIZE`,
    /// `DOG_UPLOAD__MAX_RETRIES` and so on; unset keys keep their defaults.
    pub fn from_env(prefix: &str) -> UploadResult<Self> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Same as [`UploadConfig::from_env`] with a custom variable source
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> UploadResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("{}__{}", prefix, key));
        let mut config = Self::default();

        if let Some(v) = get("CHUNK_SIZE") {
            config.chunk_size = parse_number("CHUNK_SIZE", &v)?;
        }
        if let Some(v) = get("MAX_CONCURRENT_TRANSFERS") {
            config.max_concurrent_transfers = parse_number("MAX_CONCURRENT_TRANSFERS", &v)?;
        }
        if let Some(v) = get("MAX_FILE_BYTES") {
            config.max_file_bytes = parse_number("MAX_FILE_BYTES", &v)?;
        }
        if let Some(v) = get("MAX_REPLANS") {
            config.max_replans = parse_number("MAX_REPLANS", &v)?;
        }
        if let Some(v) = get("CHUNK_TIMEOUT_MS") {
            config.chunk_timeout = Duration::from_millis(parse_number("CHUNK_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("MAX_RETRIES") {
            config.retry.max_retries = parse_number("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("BASE_BACKOFF_MS") {
            config.retry.base_backoff = Duration::from_millis(parse_number("BASE_BACKOFF_MS", &v)?);
        }
        if let Some(v) = get("MAX_BACKOFF_MS") {
            config.retry.max_backoff = Duration::from_millis(parse_number("MAX_BACKOFF_MS", &v)?);
        }
        if let Some(v) = get("IGNORED_FILE_NAMES") {
            config.ignored_file_names = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> UploadResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| UploadError::configuration(format!("{} is not a valid number: {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new()
            .with_base_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(350));

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn defaults_are_valid() {
        let config = UploadConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.is_ignored(".DS_Store"));
        assert!(config.is_ignored("photos/.DS_Store"));
        assert!(!config.is_ignored("report.pdf"));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let config = UploadConfig::new().with_chunk_size(0);
        assert!(matches!(config.validate(), Err(UploadError::Configuration { .. })));
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("DOG_UPLOAD__CHUNK_SIZE", "1024"),
            ("DOG_UPLOAD__MAX_RETRIES", "5"),
            ("DOG_UPLOAD__BASE_BACKOFF_MS", "10"),
            ("DOG_UPLOAD__IGNORED_FILE_NAMES", "Thumbs.db, .DS_Store"),
        ]
        .into_iter()
        .collect();

        let config =
            UploadConfig::from_lookup("DOG_UPLOAD", |k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_backoff, Duration::from_millis(10));
        assert_eq!(config.max_concurrent_transfers, 4);
        assert!(config.is_ignored("Thumbs.db"));
    }

    #[test]
    fn lookup_rejects_garbage() {
        let result = UploadConfig::from_lookup("DOG_UPLOAD", |k| {
            (k == "DOG_UPLOAD__MAX_REPLANS").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(UploadError::Configuration { .. })));
    }
}
