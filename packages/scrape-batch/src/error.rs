//! Typed errors for the batch extraction library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.
//!
//! Only [`BatchError`] ever reaches the caller of a batch. Item-level
//! failures ([`ExtractionError`]) are turned into data on the item's
//! result, and store failures ([`StoreError`]) degrade the component
//! that hit them.

use std::time::Duration;

use thiserror::Error;

use crate::types::item::BatchReport;

/// Boxed error returned by external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Batch-level failures, surfaced to the caller.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The batch had no work items
    #[error("batch must contain at least one source")]
    EmptyBatch,

    /// Batch configuration is unusable
    #[error("invalid batch config: {reason}")]
    InvalidConfig { reason: String },

    /// An item failed while `continue_on_error` was off
    #[error("batch aborted at item {index} ({source_id}): {reason}")]
    Aborted {
        index: usize,
        source_id: String,
        reason: String,
    },

    /// Every item failed
    #[error("0 of {total} items succeeded")]
    NoneSucceeded {
        total: usize,
        report: Box<BatchReport>,
    },
}

/// Item-level failures. These end up as the `error` of an item result.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Every model in the fallback chain failed
    #[error("all {attempts} models failed ({}); last error: {last_error}", .models.join(", "))]
    AllModelsFailed {
        attempts: usize,
        models: Vec<String>,
        last_error: String,
    },

    /// The extractor itself failed
    #[error("extractor error: {0}")]
    Extractor(#[source] BoxError),

    /// The extractor returned nothing usable
    #[error("empty result from model {model}")]
    EmptyResult { model: String },

    /// Per-item deadline exceeded
    #[error("timeout after {:.1}s extracting {source_id}", .after.as_secs_f64())]
    Timeout { source_id: String, after: Duration },

    /// Schema mismatch under strict validation
    #[error("validation against schema {schema} failed: {reason}")]
    ValidationFailed { schema: String, reason: String },

    /// The batch was cancelled before the item finished
    #[error("cancelled before completion")]
    Cancelled,

    /// The pipeline panicked
    #[error("pipeline panicked: {reason}")]
    Panicked { reason: String },

    /// No concurrency slot could be acquired
    #[error("concurrency limiter closed")]
    SlotUnavailable,
}

impl ExtractionError {
    /// Whether this is a deadline failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors from cache and metrics backing stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Store operation failed
    #[error("store error: {0}")]
    Backend(#[source] BoxError),

    /// Stored value could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error (CSV export)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(Box::new(e))
    }
}

/// Errors loading settings from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable was set but could not be parsed
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// A named preset or level does not exist
    #[error("unknown {kind} {name:?}")]
    UnknownName { kind: &'static str, name: String },
}

/// Result type alias for batch operations.
pub type Result<T> = std::result::Result<T, BatchError>;

/// Result type alias for per-item extraction.
pub type ExtractionResult<T> = std::result::Result<T, ExtractionError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
