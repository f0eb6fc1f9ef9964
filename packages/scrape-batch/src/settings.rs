//! Environment configuration.
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `SCRAPER_MAX_CONCURRENT` | concurrency slots | 5 |
//! | `SCRAPER_TIMEOUT_SECS` | per-item deadline | 30 |
//! | `SCRAPER_CONTINUE_ON_ERROR` | keep going after failures | true |
//! | `SCRAPER_USE_CACHE` | result cache | true |
//! | `SCRAPER_RATE_LIMIT` | preset name (`none` disables) | batch default |
//! | `SCRAPER_STEALTH` | stealth level (`off` disables) | off |
//! | `SCRAPER_CACHE_TTL_HOURS` | cache entry lifetime | 24 |
//! | `SCRAPER_CACHE_URL` | SQLite URL for the cache | none |
//! | `SCRAPER_METRICS_URL` | SQLite URL for metrics | none |
//! | `SCRAPER_MODELS` | comma-separated fallback chain | default chain |

use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cache::ResultCache;
use crate::error::ConfigError;
use crate::metrics::MetricsSink;
use crate::orchestrator::{BatchOrchestrator, BatchOrchestratorBuilder};
use crate::rate_limit::{RateLimitPreset, RateLimiter};
use crate::stealth::{StealthConfig, StealthLevel};
use crate::traits::extractor::Extractor;
use crate::types::config::BatchConfig;
use crate::types::model::ModelConfig;

/// Settings loaded from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub batch: BatchConfig,

    /// `None` keeps the orchestrator's default limiter
    pub rate_limit: Option<RateLimitPreset>,

    pub stealth: StealthLevel,

    pub cache_url: Option<String>,

    pub metrics_url: Option<String>,

    /// Empty means the default chain
    pub models: Vec<ModelConfig>,
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

impl Settings {
    /// Load settings from the process environment (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load settings through a variable lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut batch = BatchConfig::default();

        if let Some(raw) = lookup("SCRAPER_MAX_CONCURRENT") {
            batch.max_concurrent = parse("SCRAPER_MAX_CONCURRENT", &raw)?;
        }
        if let Some(raw) = lookup("SCRAPER_TIMEOUT_SECS") {
            let secs: f64 = parse("SCRAPER_TIMEOUT_SECS", &raw)?;
            batch.per_item_timeout =
                Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
                    var: "SCRAPER_TIMEOUT_SECS",
                    value: raw.clone(),
                    reason: e.to_string(),
                })?;
        }
        if let Some(raw) = lookup("SCRAPER_CONTINUE_ON_ERROR") {
            batch.continue_on_error = parse_bool("SCRAPER_CONTINUE_ON_ERROR", &raw)?;
        }
        if let Some(raw) = lookup("SCRAPER_USE_CACHE") {
            batch.use_cache = parse_bool("SCRAPER_USE_CACHE", &raw)?;
        }
        if let Some(raw) = lookup("SCRAPER_CACHE_TTL_HOURS") {
            let hours: u64 = parse("SCRAPER_CACHE_TTL_HOURS", &raw)?;
            let secs = hours
                .checked_mul(60 * 60)
                .ok_or_else(|| ConfigError::InvalidValue {
                    var: "SCRAPER_CACHE_TTL_HOURS",
                    value: raw.clone(),
                    reason: "too many hours".to_string(),
                })?;
            batch.cache_ttl = Duration::from_secs(secs);
        }

        let rate_limit = lookup("SCRAPER_RATE_LIMIT")
            .map(|raw| parse::<RateLimitPreset>("SCRAPER_RATE_LIMIT", &raw))
            .transpose()?;
        if rate_limit == Some(RateLimitPreset::None) {
            batch.use_rate_limiting = false;
        }

        let stealth = lookup("SCRAPER_STEALTH")
            .map(|raw| parse::<StealthLevel>("SCRAPER_STEALTH", &raw))
            .transpose()?
            .unwrap_or(StealthLevel::Off);
        batch.use_stealth = stealth != StealthLevel::Off;

        let models = lookup("SCRAPER_MODELS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(ModelConfig::new)
                    .collect()
            })
            .unwrap_or_default();

        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        Ok(Self {
            batch,
            rate_limit,
            stealth,
            cache_url: non_empty(lookup("SCRAPER_CACHE_URL")),
            metrics_url: non_empty(lookup("SCRAPER_METRICS_URL")),
            models,
        })
    }

    /// Start an orchestrator builder wired to these settings.
    ///
    /// Stores that cannot be opened leave their component disabled.
    pub async fn builder(&self, extractor: impl Extractor + 'static) -> BatchOrchestratorBuilder {
        let mut builder = BatchOrchestrator::builder(extractor)
            .config(self.batch.clone())
            .models(self.models.clone())
            .cache(self.open_cache().await)
            .metrics(self.open_metrics().await);

        if let Some(preset) = self.rate_limit {
            builder = builder.rate_limiter(RateLimiter::from_preset(preset).map(Arc::new));
        }
        if self.stealth != StealthLevel::Off {
            builder = builder.stealth(StealthConfig::preset(self.stealth));
        }
        builder
    }

    #[cfg(feature = "sqlite")]
    async fn open_cache(&self) -> ResultCache {
        let Some(url) = &self.cache_url else {
            return ResultCache::disabled();
        };
        match crate::stores::SqliteStore::new(url).await {
            Ok(store) => ResultCache::connect(Arc::new(store))
                .await
                .with_ttl(self.batch.cache_ttl),
            Err(e) => {
                warn!(error = %e, "Cache store unavailable, caching disabled");
                ResultCache::disabled()
            }
        }
    }

    #[cfg(feature = "sqlite")]
    async fn open_metrics(&self) -> MetricsSink {
        let Some(url) = &self.metrics_url else {
            return MetricsSink::disabled();
        };
        match crate::stores::SqliteStore::new(url).await {
            Ok(store) => MetricsSink::new(Arc::new(store)),
            Err(e) => {
                warn!(error = %e, "Metrics store unavailable, metrics disabled");
                MetricsSink::disabled()
            }
        }
    }

    #[cfg(not(feature = "sqlite"))]
    async fn open_cache(&self) -> ResultCache {
        if self.cache_url.is_some() {
            warn!("SCRAPER_CACHE_URL set but the sqlite feature is off, caching disabled");
        }
        ResultCache::disabled()
    }

    #[cfg(not(feature = "sqlite"))]
    async fn open_metrics(&self) -> MetricsSink {
        if self.metrics_url.is_some() {
            warn!("SCRAPER_METRICS_URL set but the sqlite feature is off, metrics disabled");
        }
        MetricsSink::disabled()
    }
}
