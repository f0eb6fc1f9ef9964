//! Attempt records and aggregate statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::types::item::ItemResult;

/// One extraction attempt, as persisted by the metrics store.
///
/// Records are append-only. The prompt is only ever stored hashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Row id, assigned by the store
    pub id: Option<i64>,

    pub timestamp: DateTime<Utc>,

    /// Source the attempt was for
    pub source: String,

    /// Truncated SHA-256 of the prompt
    pub prompt_hash: String,

    /// Model used, or `unknown`
    pub model: String,

    /// Pipeline wall time in seconds
    pub execution_time: f64,

    pub token_count: Option<i64>,

    pub retry_count: u32,

    pub fallback_attempts: u32,

    pub cached: bool,

    /// None when no schema validation ran
    pub validation_passed: Option<bool>,

    pub schema_used: Option<String>,

    pub error: Option<String>,
}

impl MetricRecord {
    /// Create a record for `source` with everything else defaulted.
    pub fn new(source: impl Into<String>, prompt: &str, model: impl Into<String>) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            source: source.into(),
            prompt_hash: Self::hash_prompt(prompt),
            model: model.into(),
            execution_time: 0.0,
            token_count: None,
            retry_count: 0,
            fallback_attempts: 1,
            cached: false,
            validation_passed: None,
            schema_used: None,
            error: None,
        }
    }

    /// Build the record for a finished pipeline.
    pub fn from_result(result: &ItemResult, prompt: &str, schema: Option<&str>) -> Self {
        Self {
            timestamp: result.completed_at,
            execution_time: result.execution_time.as_secs_f64(),
            fallback_attempts: result.fallback_attempts as u32,
            cached: result.cached,
            validation_passed: result.validation_passed,
            schema_used: schema.map(str::to_string),
            error: result.error().map(str::to_string),
            ..Self::new(
                &result.source,
                prompt,
                result.model_used.as_deref().unwrap_or("unknown"),
            )
        }
    }

    /// First 16 hex chars of the prompt's SHA-256.
    pub fn hash_prompt(prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        let mut hash = format!("{:x}", hasher.finalize());
        hash.truncate(16);
        hash
    }

    /// Set the execution time in seconds.
    pub fn with_execution_time(mut self, secs: f64) -> Self {
        self.execution_time = secs;
        self
    }

    /// Mark as a cache hit.
    pub fn with_cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    /// Attach an error.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach a validation verdict.
    pub fn with_validation(mut self, passed: bool) -> Self {
        self.validation_passed = Some(passed);
        self
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// How often one model was used inside a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model: String,
    pub count: u64,
}

/// Aggregates over a time window.
///
/// Averages and rates are `None` when the window holds no attempts,
/// so "no data" is never reported as a perfect score.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_attempts: u64,

    /// Mean execution time in seconds
    pub avg_execution_time: Option<f64>,

    pub cache_hits: u64,

    pub errors: u64,

    pub validation_failures: u64,

    pub total_retries: u64,

    pub avg_tokens: Option<f64>,

    /// Percentage of attempts served from cache
    pub cache_hit_rate: Option<f64>,

    /// Percentage of attempts with an error
    pub error_rate: Option<f64>,

    /// Model usage, most used first
    pub model_usage: Vec<ModelUsage>,
}

impl AggregateStats {
    /// Aggregate a set of records already filtered to the window.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a MetricRecord>) -> Self {
        let mut stats = AggregateStats::default();
        let mut time_sum = 0.0;
        let mut token_sum = 0.0;
        let mut token_rows = 0u64;
        let mut usage: HashMap<&str, u64> = HashMap::new();

        for record in records {
            stats.total_attempts += 1;
            time_sum += record.execution_time;
            if record.cached {
                stats.cache_hits += 1;
            }
            if record.error.is_some() {
                stats.errors += 1;
            }
            if record.validation_passed == Some(false) {
                stats.validation_failures += 1;
            }
            stats.total_retries += u64::from(record.retry_count);
            if let Some(tokens) = record.token_count {
                token_sum += tokens as f64;
                token_rows += 1;
            }
            *usage.entry(record.model.as_str()).or_insert(0) += 1;
        }

        if stats.total_attempts > 0 {
            let total = stats.total_attempts as f64;
            stats.avg_execution_time = Some(time_sum / total);
            stats.cache_hit_rate = Some(stats.cache_hits as f64 / total * 100.0);
            stats.error_rate = Some(stats.errors as f64 / total * 100.0);
        }
        if token_rows > 0 {
            stats.avg_tokens = Some(token_sum / token_rows as f64);
        }

        let mut model_usage: Vec<_> = usage
            .into_iter()
            .map(|(model, count)| ModelUsage {
                model: model.to_string(),
                count,
            })
            .collect();
        model_usage.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.model.cmp(&b.model)));
        stats.model_usage = model_usage;

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_is_hashed() {
        let record = MetricRecord::new("https://example.com", "Extract the secret title", "m");
        assert_eq!(record.prompt_hash.len(), 16);
        assert!(!record.prompt_hash.contains("secret"));
        assert_eq!(record.prompt_hash, MetricRecord::hash_prompt("Extract the secret title"));
    }

    #[test]
    fn test_empty_window_is_undefined_not_zero() {
        let stats = AggregateStats::from_records(&Vec::<MetricRecord>::new());
        assert_eq!(stats.total_attempts, 0);
        assert!(stats.avg_execution_time.is_none());
        assert!(stats.cache_hit_rate.is_none());
        assert!(stats.error_rate.is_none());
        assert!(stats.model_usage.is_empty());
    }

    #[test]
    fn test_aggregate_rates_and_histogram() {
        let records = vec![
            MetricRecord::new("a", "p", "llama3.1").with_execution_time(2.0),
            MetricRecord::new("b", "p", "llama3.1")
                .with_execution_time(4.0)
                .with_cached(true),
            MetricRecord::new("c", "p", "qwen")
                .with_execution_time(6.0)
                .with_error("boom")
                .with_validation(false),
            MetricRecord::new("d", "p", "llama3.1").with_execution_time(0.0),
        ];

        let stats = AggregateStats::from_records(&records);
        assert_eq!(stats.total_attempts, 4);
        assert_eq!(stats.avg_execution_time, Some(3.0));
        assert_eq!(stats.cache_hit_rate, Some(25.0));
        assert_eq!(stats.error_rate, Some(25.0));
        assert_eq!(stats.validation_failures, 1);
        assert_eq!(
            stats.model_usage,
            vec![
                ModelUsage { model: "llama3.1".into(), count: 3 },
                ModelUsage { model: "qwen".into(), count: 1 },
            ]
        );
    }
}
