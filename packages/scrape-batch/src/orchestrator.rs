//! Batch orchestrator.
//!
//! Drives one pipeline per work item under a counting semaphore:
//!
//! ```text
//! acquire slot → cache lookup ─┬─ hit ────────────────────────────────┐
//!                              └─ miss → rate limit → extract         │
//!                                        → validate → cache write ────┤
//!                                                                     ▼
//!                                   metrics → (orchestrator) progress
//! ```
//!
//! Each pipeline runs as its own task. Item-level failures, timeouts and
//! panics all become failed [`ItemResult`]s, so one item can never take
//! down its siblings. The orchestrator is the single consumer of
//! finished pipelines: it counts completions, reports progress, and
//! slots results back into submission order.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::{CacheStats, ResultCache};
use crate::error::{BatchError, ExtractionError, Result};
use crate::fallback::FallbackExecutor;
use crate::metrics::MetricsSink;
use crate::rate_limit::{RateLimitConfig, RateLimiter, RateLimiterStats};
use crate::stealth::{StealthConfig, StealthHeaders, StealthLevel};
use crate::traits::extractor::Extractor;
use crate::traits::validator::{SchemaRegistry, Validation, Validator, NO_SCHEMA};
use crate::types::config::BatchConfig;
use crate::types::item::{BatchReport, ItemResult, Progress, WorkItem};
use crate::types::metric::{AggregateStats, MetricRecord};
use crate::types::model::ModelConfig;

/// Window used for the metrics part of [`OrchestratorStats`].
const STATS_WINDOW_DAYS: u32 = 7;

/// Combined snapshot of the orchestrator's components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub cache: CacheStats,
    pub rate_limiter: Option<RateLimiterStats>,
    pub metrics: AggregateStats,
    pub available_models: Vec<String>,
    pub last_successful_model: Option<String>,
}

/// Everything a pipeline needs, shared read-only across tasks.
struct Inner {
    config: BatchConfig,
    extractor: Arc<dyn Extractor>,
    fallback: FallbackExecutor,
    validator: Arc<dyn Validator>,
    cache: ResultCache,
    metrics: MetricsSink,
    rate_limiter: Option<Arc<RateLimiter>>,
    stealth: Option<StealthConfig>,
    stealth_headers: StealthHeaders,
    extractor_params: Map<String, Value>,
}

/// Runs batches of extraction work items.
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

/// Builder for [`BatchOrchestrator`].
pub struct BatchOrchestratorBuilder {
    extractor: Arc<dyn Extractor>,
    config: BatchConfig,
    chain: Vec<ModelConfig>,
    validator: Option<Arc<dyn Validator>>,
    cache: Option<ResultCache>,
    metrics: Option<MetricsSink>,
    rate_limiter: Option<Option<Arc<RateLimiter>>>,
    stealth: Option<StealthConfig>,
    extractor_params: Map<String, Value>,
    cancel: Option<CancellationToken>,
}

impl BatchOrchestratorBuilder {
    fn new(extractor: Arc<dyn Extractor>) -> Self {
        Self {
            extractor,
            config: BatchConfig::default(),
            chain: Vec::new(),
            validator: None,
            cache: None,
            metrics: None,
            rate_limiter: None,
            stealth: None,
            extractor_params: Map::new(),
            cancel: None,
        }
    }

    /// Set the batch policy.
    pub fn config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the fallback chain. Empty means the default chain.
    pub fn models(mut self, chain: Vec<ModelConfig>) -> Self {
        self.chain = chain;
        self
    }

    /// Set the schema validator. Defaults to an empty [`SchemaRegistry`].
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Set the result cache. Defaults to a disabled cache.
    pub fn cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the metrics sink. Defaults to a disabled sink.
    pub fn metrics(mut self, metrics: MetricsSink) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Share a rate limiter. `None` disables the gate even when
    /// `use_rate_limiting` is on.
    pub fn rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Set the stealth configuration used when `use_stealth` is on.
    pub fn stealth(mut self, stealth: StealthConfig) -> Self {
        self.stealth = Some(stealth);
        self
    }

    /// Extra extractor parameters, overlaid on each model's own.
    pub fn extractor_params(mut self, params: Map<String, Value>) -> Self {
        self.extractor_params = params;
        self
    }

    /// Cancel in-flight batches when `token` is cancelled.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> Result<BatchOrchestrator> {
        self.config.validate()?;

        // Rate limiting on without an explicit limiter gets the batch default
        let rate_limiter = match self.rate_limiter {
            Some(limiter) => limiter,
            None if self.config.use_rate_limiting => {
                Some(Arc::new(RateLimiter::new(RateLimitConfig::batch_default())))
            }
            None => None,
        };

        let stealth = match self.stealth {
            Some(stealth) => Some(stealth),
            None if self.config.use_stealth => Some(StealthConfig::preset(StealthLevel::Medium)),
            None => None,
        };

        Ok(BatchOrchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                extractor: self.extractor,
                fallback: FallbackExecutor::new(self.chain),
                validator: self
                    .validator
                    .unwrap_or_else(|| Arc::new(SchemaRegistry::new())),
                cache: self.cache.unwrap_or_else(ResultCache::disabled),
                metrics: self.metrics.unwrap_or_else(MetricsSink::disabled),
                rate_limiter,
                stealth,
                stealth_headers: StealthHeaders::new(),
                extractor_params: self.extractor_params,
            }),
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

impl BatchOrchestrator {
    /// Start building an orchestrator around an extractor.
    pub fn builder(extractor: impl Extractor + 'static) -> BatchOrchestratorBuilder {
        BatchOrchestratorBuilder::new(Arc::new(extractor))
    }

    /// Start building around an already shared extractor.
    pub fn builder_shared(extractor: Arc<dyn Extractor>) -> BatchOrchestratorBuilder {
        BatchOrchestratorBuilder::new(extractor)
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }

    pub fn metrics(&self) -> &MetricsSink {
        &self.inner.metrics
    }

    pub fn fallback(&self) -> &FallbackExecutor {
        &self.inner.fallback
    }

    /// Token that cancels this orchestrator's batches.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process a batch without progress reporting.
    pub async fn process<S: AsRef<str>>(
        &self,
        sources: &[S],
        prompt: &str,
        schema: Option<&str>,
    ) -> Result<BatchReport> {
        self.process_with_progress(sources, prompt, schema, |_| {})
            .await
    }

    /// Process a batch, calling `on_progress` once per finished item.
    ///
    /// `completed` counts strictly up from 1 to the batch size. The
    /// callback runs on the caller's task, never concurrently with itself.
    pub async fn process_with_progress<S, F>(
        &self,
        sources: &[S],
        prompt: &str,
        schema: Option<&str>,
        mut on_progress: F,
    ) -> Result<BatchReport>
    where
        S: AsRef<str>,
        F: FnMut(Progress),
    {
        if sources.is_empty() {
            return Err(BatchError::EmptyBatch);
        }

        let items = WorkItem::from_sources(sources);
        let total = items.len();
        let batch_id = Uuid::now_v7();
        let span = info_span!("batch", %batch_id, items = total);

        async move {
            let started = Instant::now();
            info!(
                max_concurrent = self.inner.config.max_concurrent,
                "Starting batch"
            );

            let semaphore = Arc::new(Semaphore::new(self.inner.config.max_concurrent));
            let prompt: Arc<str> = Arc::from(prompt);
            let schema: Option<Arc<str>> = schema.map(Arc::from);

            let mut tasks = JoinSet::new();
            for item in items.iter().cloned() {
                let inner = Arc::clone(&self.inner);
                let semaphore = Arc::clone(&semaphore);
                let cancel = self.cancel.clone();
                let prompt = Arc::clone(&prompt);
                let schema = schema.clone();
                let span = info_span!("item", index = item.index, source = %item.source);

                tasks.spawn(
                    async move { inner.run_item(item, semaphore, cancel, prompt, schema).await }
                        .instrument(span),
                );
            }

            let mut slots: Vec<Option<ItemResult>> = vec![None; total];
            let mut completed = 0;

            while let Some(joined) = tasks.join_next().await {
                let result = match joined {
                    Ok(result) => result,
                    Err(e) => {
                        // Pipelines catch their own panics; this is runtime shutdown
                        error!(error = %e, "Pipeline task failed");
                        continue;
                    }
                };

                completed += 1;
                on_progress(Progress {
                    completed,
                    total,
                    source: result.source.clone(),
                    success: result.is_success(),
                });

                if !self.inner.config.continue_on_error {
                    if let Some(reason) = result.error() {
                        tasks.abort_all();
                        error!(index = result.index, error = %reason, "Aborting batch");
                        return Err(BatchError::Aborted {
                            index: result.index,
                            source_id: result.source.clone(),
                            reason: reason.to_string(),
                        });
                    }
                }

                let index = result.index;
                slots[index] = Some(result);
            }

            // Every item yields exactly one result, even if its task was lost
            let mut results = Vec::with_capacity(total);
            for (item, slot) in items.iter().zip(slots) {
                let result = match slot {
                    Some(result) => result,
                    None => {
                        let result = ItemResult::failed(
                            item,
                            ExtractionError::Panicked {
                                reason: "pipeline task was lost".to_string(),
                            }
                            .to_string(),
                        );
                        completed += 1;
                        on_progress(Progress {
                            completed,
                            total,
                            source: item.source.clone(),
                            success: false,
                        });
                        result
                    }
                };
                results.push(result);
            }

            let report = BatchReport {
                batch_id,
                results,
                total_time: started.elapsed(),
            };

            info!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                cached = report.cached(),
                elapsed_ms = report.total_time.as_millis() as u64,
                "Batch complete"
            );

            if !report.is_success() {
                return Err(BatchError::NoneSucceeded {
                    total,
                    report: Box::new(report),
                });
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Snapshot of cache, rate limiter, metrics and fallback state.
    pub async fn stats(&self) -> OrchestratorStats {
        let rate_limiter = match &self.inner.rate_limiter {
            Some(limiter) => Some(limiter.stats().await),
            None => None,
        };

        OrchestratorStats {
            cache: self.inner.cache.stats().await,
            rate_limiter,
            metrics: self.inner.metrics.aggregate_stats(STATS_WINDOW_DAYS).await,
            available_models: self.inner.fallback.available_models(),
            last_successful_model: self.inner.fallback.last_successful_model(),
        }
    }
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("config", &self.inner.config)
            .field("models", &self.inner.fallback.available_models())
            .field("cache", &self.inner.cache)
            .field("metrics", &self.inner.metrics)
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Run one item to a result, whatever happens inside the pipeline.
    async fn run_item(
        self: Arc<Self>,
        item: WorkItem,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
        prompt: Arc<str>,
        schema: Option<Arc<str>>,
    ) -> ItemResult {
        let schema = schema.as_deref().filter(|s| *s != NO_SCHEMA);

        // Slot wait is not counted against the item's deadline
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExtractionError::Cancelled),
            permit = Arc::clone(&semaphore).acquire_owned() => {
                permit.map_err(|_| ExtractionError::SlotUnavailable)
            }
        };

        let started = Instant::now();
        let (result, _permit) = match permit {
            Err(e) => (ItemResult::failed(&item, e.to_string()), None),
            Ok(permit) => {
                let timeout = self.config.per_item_timeout;
                let pipeline = AssertUnwindSafe(self.pipeline(&item, &prompt, schema)).catch_unwind();

                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ExtractionError::Cancelled),
                    outcome = tokio::time::timeout(timeout, pipeline) => match outcome {
                        Err(_) => Err(ExtractionError::Timeout {
                            source_id: item.source.clone(),
                            after: timeout,
                        }),
                        Ok(Err(panic)) => Err(ExtractionError::Panicked {
                            reason: panic_message(&*panic),
                        }),
                        Ok(Ok(result)) => Ok(result),
                    },
                };

                let result = outcome.unwrap_or_else(|e| ItemResult::failed(&item, e.to_string()));
                (result, Some(permit))
            }
        };

        // Metrics are written before the slot is released
        self.finish(result, started, &prompt, schema).await
    }

    /// Stamp timing, log, and record the metric for a finished item.
    async fn finish(
        &self,
        mut result: ItemResult,
        started: Instant,
        prompt: &str,
        schema: Option<&str>,
    ) -> ItemResult {
        result.execution_time = started.elapsed();
        result.completed_at = chrono::Utc::now();

        match result.error() {
            None => debug!(
                model = result.model_used.as_deref().unwrap_or("unknown"),
                cached = result.cached,
                attempts = result.fallback_attempts,
                elapsed_ms = result.execution_time.as_millis() as u64,
                "Item succeeded"
            ),
            Some(reason) => error!(
                error = %reason,
                elapsed_ms = result.execution_time.as_millis() as u64,
                "Item failed"
            ),
        }

        self.metrics
            .log_attempt(&MetricRecord::from_result(&result, prompt, schema))
            .await;
        result
    }

    /// Cache key parameters: identical for lookup and write.
    fn cache_params(&self, schema: Option<&str>) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert(
            "model".to_string(),
            Value::String(self.fallback.primary().name.clone()),
        );
        params.insert(
            "schema".to_string(),
            Value::String(schema.unwrap_or(NO_SCHEMA).to_string()),
        );
        params
    }

    /// Extractor parameters for this attempt, with stealth headers merged in.
    fn attempt_params(&self) -> Map<String, Value> {
        let mut params = self.extractor_params.clone();
        let Some(stealth) = self.stealth.as_ref().filter(|_| self.config.use_stealth) else {
            return params;
        };

        let mut headers: Map<String, Value> = self
            .stealth_headers
            .headers(stealth)
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        // Caller-supplied headers win
        if let Some(Value::Object(existing)) = params.get("headers") {
            for (k, v) in existing {
                headers.insert(k.clone(), v.clone());
            }
        }
        params.insert("headers".to_string(), Value::Object(headers));
        params
    }

    /// The per-item pipeline, from cache lookup to cache write.
    async fn pipeline(&self, item: &WorkItem, prompt: &str, schema: Option<&str>) -> ItemResult {
        let config = &self.config;
        let cache_params = self.cache_params(schema);

        if config.use_cache {
            if let Some(data) = self.cache.get(&item.source, prompt, &cache_params).await {
                let mut result = ItemResult::succeeded(item, data);
                result.cached = true;
                result.model_used = Some(self.fallback.primary().name.clone());
                return result;
            }
        }

        if config.use_rate_limiting {
            if let Some(limiter) = &self.rate_limiter {
                let waited = limiter.wait().await;
                debug!(waited_ms = waited.as_millis() as u64, "Rate limiter passed");
            }
        }

        let params = self.attempt_params();
        let extraction = if config.use_fallback {
            self.fallback
                .execute_with_fallback(self.extractor.as_ref(), prompt, &item.source, &params)
                .await
        } else {
            self.fallback
                .execute_single(self.extractor.as_ref(), prompt, &item.source, &params)
                .await
        };

        let success = match extraction {
            Ok(success) => success,
            Err(e) => {
                let attempts = match &e {
                    ExtractionError::AllModelsFailed { attempts, .. } => *attempts,
                    _ => 1,
                };
                let mut result = ItemResult::failed(item, e.to_string());
                result.fallback_attempts = attempts;
                return result;
            }
        };

        let mut data = success.data;
        let mut validation_passed = None;
        if let Some(schema) = schema.filter(|_| config.validate_results) {
            match self.validator.validate(&data, schema) {
                Validation::Valid(normalized) => {
                    data = normalized;
                    validation_passed = Some(true);
                }
                Validation::Invalid(reason) => {
                    warn!(schema = %schema, reason = %reason, "Validation failed");
                    validation_passed = Some(false);

                    if config.strict_validation {
                        let error = ExtractionError::ValidationFailed {
                            schema: schema.to_string(),
                            reason,
                        };
                        let mut result = ItemResult::failed(item, error.to_string());
                        result.model_used = Some(success.model_used);
                        result.fallback_attempts = success.attempts;
                        result.validation_passed = validation_passed;
                        return result;
                    }
                }
            }
        }

        if config.use_cache {
            self.cache
                .set(&item.source, prompt, &data, Some(config.cache_ttl), &cache_params)
                .await;
        }

        let mut result = ItemResult::succeeded(item, data);
        result.model_used = Some(success.model_used);
        result.fallback_attempts = success.attempts;
        result.validation_passed = validation_passed;
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Convenience for building the `headers` extractor parameter.
pub fn headers_param<'a>(headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Map<String, Value> {
    let headers: Map<String, Value> = headers
        .into_iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect();
    let mut params = Map::new();
    params.insert("headers".to_string(), Value::Object(headers));
    params
}
