//! Bounded-Concurrency Batch Extraction
//!
//! Runs many slow, failure-prone extraction calls (one per source URL)
//! under a concurrency limit, with a result cache, a politeness rate
//! limiter, a model fallback chain, schema validation and persistent
//! attempt metrics.
//!
//! # Guarantees
//!
//! - One result per submitted source, returned in submission order
//! - At most `max_concurrent` pipelines hold a slot at any instant
//! - Item failures, timeouts and panics never abort sibling items
//!   (unless `continue_on_error` is off)
//! - Exactly one progress event per item, with a strictly increasing count
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use scrape_batch::{BatchConfig, BatchOrchestrator, MemoryStore, MetricsSink, ResultCache};
//!
//! let store = Arc::new(MemoryStore::new());
//! let orchestrator = BatchOrchestrator::builder(my_extractor)
//!     .config(BatchConfig::new().with_max_concurrent(3))
//!     .cache(ResultCache::connect(store.clone()).await)
//!     .metrics(MetricsSink::new(store))
//!     .build()?;
//!
//! let report = orchestrator
//!     .process_with_progress(&urls, "Extract the product name and price", Some("product"), |p| {
//!         println!("{}/{} {}", p.completed, p.total, p.source);
//!     })
//!     .await?;
//! ```
//!
//! # Modules
//!
//! - [`orchestrator`] - Batch driver (the core)
//! - [`fallback`] - Sequential model fallback
//! - [`rate_limit`] - Jittered delay gate and presets
//! - [`cache`] - Content-addressed result cache
//! - [`metrics`] - Attempt metrics and CSV export
//! - [`stealth`] - Anti-detection header tables
//! - [`traits`] - Extractor, validator and store abstractions
//! - [`stores`] - Store implementations (MemoryStore, SqliteStore)
//! - [`settings`] - Environment configuration
//! - [`testing`] - Mock implementations for testing

pub mod cache;
pub mod error;
pub mod fallback;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limit;
pub mod settings;
pub mod stealth;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

// Re-export core types at crate root
pub use cache::{cache_key, CacheStats, ResultCache};
pub use error::{BatchError, BoxError, ConfigError, ExtractionError, Result, StoreError};
pub use fallback::{FallbackExecutor, FallbackSuccess};
pub use metrics::MetricsSink;
pub use orchestrator::{BatchOrchestrator, BatchOrchestratorBuilder, OrchestratorStats};
pub use rate_limit::{RateLimitConfig, RateLimitPreset, RateLimiter, RateLimiterStats};
pub use settings::Settings;
pub use stealth::{StealthConfig, StealthHeaders, StealthLevel};
pub use stores::MemoryStore;
#[cfg(feature = "sqlite")]
pub use stores::SqliteStore;
pub use traits::{
    extractor::{BlockingExtractor, Extractor},
    store::{CacheStore, MetricsStore},
    validator::{SchemaRegistry, Validation, Validator},
};
pub use types::{
    config::BatchConfig,
    item::{BatchReport, ItemOutcome, ItemResult, Progress, WorkItem},
    metric::{AggregateStats, MetricRecord, ModelUsage},
    model::{ExtractorConfig, ModelConfig},
};
