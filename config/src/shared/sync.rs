use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Retry behavior for source requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of attempts for a single page request, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any computed delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f32,
}

impl RetryConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_INITIAL_DELAY_MS: u64 = 500;
    pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
    pub const DEFAULT_BACKOFF_FACTOR: f32 = 2.0;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "retry.max_attempts",
                constraint: "must be greater than 0",
            });
        }
        if self.backoff_factor < 1.0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "retry.backoff_factor",
                constraint: "must be at least 1.0",
            });
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

/// Tuning knobs for a sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    /// Discard all existing target rows before loading, for every entity in the run.
    #[serde(default)]
    pub full_reload: bool,
    /// Maximum number of entity pipelines running at the same time.
    #[serde(default = "default_max_concurrent_entities")]
    pub max_concurrent_entities: usize,
    /// Maximum number of in-flight source HTTP requests across the whole run.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Pages fetched concurrently per wave for page-numbered sources.
    #[serde(default = "default_page_fetch_concurrency")]
    pub page_fetch_concurrency: usize,
    /// Run deadline in seconds. Unset means no deadline.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    /// Days re-read before the last checkpoint for incremental resources.
    #[serde(default = "default_overlap_days")]
    pub overlap_days: i64,
}

impl SyncConfig {
    pub const DEFAULT_MAX_CONCURRENT_ENTITIES: usize = 4;
    pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;
    pub const DEFAULT_PAGE_FETCH_CONCURRENCY: usize = 4;
    pub const DEFAULT_OVERLAP_DAYS: i64 = 7;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_concurrent_entities == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "sync.max_concurrent_entities",
                constraint: "must be greater than 0",
            });
        }
        if self.max_concurrent_requests == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "sync.max_concurrent_requests",
                constraint: "must be greater than 0",
            });
        }
        if self.page_fetch_concurrency == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "sync.page_fetch_concurrency",
                constraint: "must be greater than 0",
            });
        }
        if self.overlap_days < 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "sync.overlap_days",
                constraint: "must not be negative",
            });
        }

        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            full_reload: false,
            max_concurrent_entities: default_max_concurrent_entities(),
            max_concurrent_requests: default_max_concurrent_requests(),
            page_fetch_concurrency: default_page_fetch_concurrency(),
            run_timeout_secs: None,
            overlap_days: default_overlap_days(),
        }
    }
}

fn default_max_attempts() -> u32 {
    RetryConfig::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_delay_ms() -> u64 {
    RetryConfig::DEFAULT_INITIAL_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    RetryConfig::DEFAULT_MAX_DELAY_MS
}

fn default_backoff_factor() -> f32 {
    RetryConfig::DEFAULT_BACKOFF_FACTOR
}

fn default_max_concurrent_entities() -> usize {
    SyncConfig::DEFAULT_MAX_CONCURRENT_ENTITIES
}

fn default_max_concurrent_requests() -> usize {
    SyncConfig::DEFAULT_MAX_CONCURRENT_REQUESTS
}

fn default_page_fetch_concurrency() -> usize {
    SyncConfig::DEFAULT_PAGE_FETCH_CONCURRENCY
}

fn default_overlap_days() -> i64 {
    SyncConfig::DEFAULT_OVERLAP_DAYS
}
