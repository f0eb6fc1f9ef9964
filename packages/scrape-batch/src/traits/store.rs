//! Storage traits for cached results and attempt metrics.
//!
//! The storage layer is split into two focused traits:
//! - `CacheStore`: key/value store with per-entry TTL
//! - `MetricsStore`: append-only table of attempt records
//!
//! Both are used concurrently by every pipeline of a batch, so
//! implementations handle their own synchronization.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::error::StoreResult;
use crate::types::metric::{AggregateStats, MetricRecord};

/// Key/value store with expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Check the store is reachable.
    async fn ping(&self) -> StoreResult<()>;

    /// Get a live (unexpired) value.
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Store a value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &Value, ttl: Duration) -> StoreResult<()>;

    /// List live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Delete keys. Returns how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<usize>;
}

/// Append-only store of attempt records.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Append a record, returning its row id.
    async fn append(&self, record: &MetricRecord) -> StoreResult<i64>;

    /// Most recent records first.
    async fn recent(&self, limit: usize) -> StoreResult<Vec<MetricRecord>>;

    /// Records at or after `since` (all when `None`), oldest first.
    async fn since(&self, since: Option<DateTime<Utc>>) -> StoreResult<Vec<MetricRecord>>;

    /// Aggregate statistics for records at or after `since`.
    async fn aggregate(&self, since: DateTime<Utc>) -> StoreResult<AggregateStats> {
        let records = self.since(Some(since)).await?;
        Ok(AggregateStats::from_records(&records))
    }
}
