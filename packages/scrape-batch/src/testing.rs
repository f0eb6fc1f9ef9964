//! Testing utilities including mock implementations.
//!
//! These are useful for testing applications that use the batch library
//! without making real extraction or network calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{BoxError, StoreError, StoreResult};
use crate::traits::extractor::Extractor;
use crate::traits::store::{CacheStore, MetricsStore};
use crate::types::metric::MetricRecord;
use crate::types::model::ExtractorConfig;

/// What the mock extractor does for a call.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return `{source, model, prompt}`
    Echo,
    /// Return this value
    Return(Value),
    /// Fail with this message
    Fail(String),
    /// Return an empty object
    Empty,
    /// Never complete
    Hang,
    /// Panic with this message
    Panic(String),
}

/// Record of a call made to the mock extractor.
#[derive(Debug, Clone)]
pub struct MockExtractorCall {
    pub source: String,
    pub prompt: String,
    pub model: String,
    pub headers: BTreeMap<String, String>,
}

/// A mock extractor with per-source and per-model behavior.
///
/// Lookup order: source+model, source, model, then the default.
/// Tracks in-flight calls so tests can check concurrency bounds.
pub struct MockExtractor {
    default: MockBehavior,
    by_source: HashMap<String, MockBehavior>,
    by_model: HashMap<String, MockBehavior>,
    by_source_model: HashMap<(String, String), MockBehavior>,
    delay: Option<Duration>,
    calls: Arc<RwLock<Vec<MockExtractorCall>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExtractor {
    /// Create a mock that echoes its inputs back.
    pub fn new() -> Self {
        Self {
            default: MockBehavior::Echo,
            by_source: HashMap::new(),
            by_model: HashMap::new(),
            by_source_model: HashMap::new(),
            delay: None,
            calls: Arc::new(RwLock::new(Vec::new())),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Return `value` for every call without a more specific behavior.
    pub fn returning(mut self, value: Value) -> Self {
        self.default = MockBehavior::Return(value);
        self
    }

    /// Set the fallback behavior.
    pub fn with_default(mut self, behavior: MockBehavior) -> Self {
        self.default = behavior;
        self
    }

    /// Behavior for one source, any model.
    pub fn with_source(mut self, source: impl Into<String>, behavior: MockBehavior) -> Self {
        self.by_source.insert(source.into(), behavior);
        self
    }

    /// Behavior for one model, any source.
    pub fn with_model(mut self, model: impl Into<String>, behavior: MockBehavior) -> Self {
        self.by_model.insert(model.into(), behavior);
        self
    }

    /// Behavior for one source and model.
    pub fn with_source_model(
        mut self,
        source: impl Into<String>,
        model: impl Into<String>,
        behavior: MockBehavior,
    ) -> Self {
        self.by_source_model
            .insert((source.into(), model.into()), behavior);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Get all calls made to this mock.
    pub fn calls(&self) -> Vec<MockExtractorCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    /// Calls made for one source.
    pub fn calls_for(&self, source: &str) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.source == source)
            .count()
    }

    /// Highest number of calls that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Calls running right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Clear call history.
    pub fn clear_calls(&self) {
        self.calls.write().unwrap().clear();
    }

    fn behavior_for(&self, source: &str, model: &str) -> MockBehavior {
        self.by_source_model
            .get(&(source.to_string(), model.to_string()))
            .or_else(|| self.by_source.get(source))
            .or_else(|| self.by_model.get(model))
            .unwrap_or(&self.default)
            .clone()
    }
}

/// Decrements the in-flight counter even when the call is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn extract(
        &self,
        prompt: &str,
        source: &str,
        config: &ExtractorConfig,
    ) -> Result<Value, BoxError> {
        self.calls.write().unwrap().push(MockExtractorCall {
            source: source.to_string(),
            prompt: prompt.to_string(),
            model: config.model.name.clone(),
            headers: config.headers(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.behavior_for(source, &config.model.name) {
            MockBehavior::Echo => Ok(json!({
                "source": source,
                "model": config.model.name,
                "prompt": prompt,
            })),
            MockBehavior::Return(value) => Ok(value),
            MockBehavior::Fail(message) => Err(message.into()),
            MockBehavior::Empty => Ok(json!({})),
            MockBehavior::Hang => std::future::pending().await,
            MockBehavior::Panic(message) => panic!("{}", message),
        }
    }
}

/// A store whose backend is always down.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnreachableStore;

impl UnreachableStore {
    fn error() -> StoreError {
        StoreError::Unavailable("connection refused".to_string())
    }
}

#[async_trait]
impl CacheStore for UnreachableStore {
    async fn ping(&self) -> StoreResult<()> {
        Err(Self::error())
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<Value>> {
        Err(Self::error())
    }

    async fn set_with_ttl(&self, _key: &str, _value: &Value, _ttl: Duration) -> StoreResult<()> {
        Err(Self::error())
    }

    async fn scan_prefix(&self, _prefix: &str) -> StoreResult<Vec<String>> {
        Err(Self::error())
    }

    async fn delete(&self, _keys: &[String]) -> StoreResult<usize> {
        Err(Self::error())
    }
}

#[async_trait]
impl MetricsStore for UnreachableStore {
    async fn append(&self, _record: &MetricRecord) -> StoreResult<i64> {
        Err(Self::error())
    }

    async fn recent(&self, _limit: usize) -> StoreResult<Vec<MetricRecord>> {
        Err(Self::error())
    }

    async fn since(&self, _since: Option<DateTime<Utc>>) -> StoreResult<Vec<MetricRecord>> {
        Err(Self::error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::model::ModelConfig;
    use serde_json::Map;

    fn config(model: &str) -> ExtractorConfig {
        ExtractorConfig::merged(&ModelConfig::new(model), &Map::new())
    }

    #[tokio::test]
    async fn test_behavior_precedence() {
        let mock = MockExtractor::new()
            .returning(json!({"from": "default"}))
            .with_model("m", MockBehavior::Return(json!({"from": "model"})))
            .with_source("s", MockBehavior::Return(json!({"from": "source"})))
            .with_source_model("s", "m", MockBehavior::Return(json!({"from": "both"})));

        let from = |v: Value| v["from"].as_str().unwrap().to_string();
        assert_eq!(from(mock.extract("p", "s", &config("m")).await.unwrap()), "both");
        assert_eq!(from(mock.extract("p", "s", &config("x")).await.unwrap()), "source");
        assert_eq!(from(mock.extract("p", "t", &config("m")).await.unwrap()), "model");
        assert_eq!(from(mock.extract("p", "t", &config("x")).await.unwrap()), "default");
        assert_eq!(mock.call_count(), 4);
        assert_eq!(mock.calls_for("s"), 2);
    }

    #[tokio::test]
    async fn test_in_flight_released_on_drop() {
        let mock = MockExtractor::new().with_default(MockBehavior::Hang);
        let cfg = config("m");

        let result = tokio::time::timeout(Duration::from_millis(10), mock.extract("p", "s", &cfg)).await;

        assert!(result.is_err());
        assert_eq!(mock.max_in_flight(), 1);
        assert_eq!(mock.in_flight(), 0);
    }
}
