//! Configuration types for batch processing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BatchError, Result};

/// Policy for one batch orchestrator.
///
/// Built once by the caller and shared read-only by every pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum number of pipelines holding a concurrency slot at once.
    ///
    /// Default: 5.
    pub max_concurrent: usize,

    /// Deadline for one item's pipeline, measured from slot acquisition.
    ///
    /// Includes rate limiter wait. Default: 30s.
    #[serde(with = "super::secs")]
    pub per_item_timeout: Duration,

    /// Convert item failures into failed results instead of aborting.
    ///
    /// Default: true.
    pub continue_on_error: bool,

    /// Look up and store results in the result cache.
    pub use_cache: bool,

    /// Wait on the rate limiter before each extractor call.
    pub use_rate_limiting: bool,

    /// Walk the whole fallback chain (otherwise only the primary model).
    pub use_fallback: bool,

    /// Validate results when a schema name is given.
    pub validate_results: bool,

    /// Merge anti-detection headers into the extractor configuration.
    ///
    /// Default: false.
    pub use_stealth: bool,

    /// Fail the item when schema validation fails.
    ///
    /// Off by default: validation failures only flag the result.
    #[serde(default)]
    pub strict_validation: bool,

    /// Time-to-live for cache writes. Default: 24h.
    #[serde(with = "super::secs")]
    pub cache_ttl: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            per_item_timeout: Duration::from_secs(30),
            continue_on_error: true,
            use_cache: true,
            use_rate_limiting: true,
            use_fallback: true,
            validate_results: true,
            use_stealth: false,
            strict_validation: false,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl BatchConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max concurrent pipelines.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the per-item deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_item_timeout = timeout;
        self
    }

    /// Set continue-on-error.
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Enable or disable the result cache.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.use_cache = enabled;
        self
    }

    /// Enable or disable rate limiting.
    pub fn with_rate_limiting(mut self, enabled: bool) -> Self {
        self.use_rate_limiting = enabled;
        self
    }

    /// Enable or disable the fallback chain.
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.use_fallback = enabled;
        self
    }

    /// Enable or disable schema validation.
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validate_results = enabled;
        self
    }

    /// Enable or disable stealth headers.
    pub fn with_stealth(mut self, enabled: bool) -> Self {
        self.use_stealth = enabled;
        self
    }

    /// Fail items on schema mismatch.
    pub fn strict_validation(mut self) -> Self {
        self.strict_validation = true;
        self
    }

    /// Set the cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Check the config can drive a batch.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(BatchError::InvalidConfig {
                reason: "max_concurrent must be at least 1".to_string(),
            });
        }
        if self.per_item_timeout.is_zero() {
            return Err(BatchError::InvalidConfig {
                reason: "per_item_timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.per_item_timeout, Duration::from_secs(30));
        assert!(config.continue_on_error);
        assert!(config.use_cache);
        assert!(config.use_rate_limiting);
        assert!(config.use_fallback);
        assert!(config.validate_results);
        assert!(!config.use_stealth);
        assert!(!config.strict_validation);
        assert_eq!(config.cache_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn test_builder_methods() {
        let config = BatchConfig::new()
            .with_max_concurrent(10)
            .with_timeout(Duration::from_secs(60))
            .with_continue_on_error(false)
            .with_cache(false)
            .with_rate_limiting(false)
            .with_fallback(false)
            .with_validation(false)
            .strict_validation();

        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.per_item_timeout, Duration::from_secs(60));
        assert!(!config.continue_on_error);
        assert!(!config.use_cache);
        assert!(!config.use_rate_limiting);
        assert!(!config.use_fallback);
        assert!(!config.validate_results);
        assert!(config.strict_validation);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = BatchConfig::new().with_max_concurrent(0);
        assert!(matches!(
            config.validate(),
            Err(BatchError::InvalidConfig { .. })
        ));
        assert!(BatchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = BatchConfig::new().with_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations_serialize_as_seconds() {
        let config = BatchConfig::new().with_timeout(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["per_item_timeout"], 1.5);

        let back: BatchConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
