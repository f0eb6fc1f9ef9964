//! In-memory storage implementation for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::StoreResult;
use crate::traits::store::{CacheStore, MetricsStore};
use crate::types::metric::MetricRecord;

struct CacheEntry {
    value: Value,
    /// `None` when the TTL reaches past the clock's range
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct MetricsTable {
    next_id: i64,
    rows: Vec<MetricRecord>,
}

/// In-memory cache entries and metric records.
///
/// Useful for testing and development. Not suitable for production
/// as data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    metrics: RwLock<MetricsTable>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all stored data.
    pub fn clear(&self) {
        write(&self.entries).clear();
        *write(&self.metrics) = MetricsTable::default();
    }

    /// Number of live cache entries.
    pub fn entry_count(&self) -> usize {
        let now = Instant::now();
        read(&self.entries)
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    /// Number of metric records.
    pub fn metric_count(&self) -> usize {
        read(&self.metrics).rows.len()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let now = Instant::now();
        {
            let entries = read(&self.entries);
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it so the map doesn't grow without bound
        write(&self.entries).remove(key);
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &Value, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = write(&self.entries);
        // Keys that are never read again would otherwise stay forever
        entries.retain(|_, e| e.is_live(now));
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                expires_at: now.checked_add(ttl),
            },
        );
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<_> = read(&self.entries)
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<usize> {
        let mut entries = write(&self.entries);
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count())
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn append(&self, record: &MetricRecord) -> StoreResult<i64> {
        let mut table = write(&self.metrics);
        table.next_id += 1;
        let id = table.next_id;
        table.rows.push(MetricRecord {
            id: Some(id),
            ..record.clone()
        });
        Ok(id)
    }

    async fn recent(&self, limit: usize) -> StoreResult<Vec<MetricRecord>> {
        let mut rows = read(&self.metrics).rows.clone();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn since(&self, since: Option<DateTime<Utc>>) -> StoreResult<Vec<MetricRecord>> {
        let mut rows: Vec<_> = read(&self.metrics)
            .rows
            .iter()
            .filter(|r| since.map_or(true, |cutoff| r.timestamp >= cutoff))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_cache_roundtrip_and_delete() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        store.set_with_ttl("scrape:a", &json!({"x": 1}), ttl).await.unwrap();
        store.set_with_ttl("scrape:b", &json!({"x": 2}), ttl).await.unwrap();
        store.set_with_ttl("other:c", &json!({"x": 3}), ttl).await.unwrap();

        assert_eq!(store.get("scrape:a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.entry_count(), 3);

        let keys = store.scan_prefix("scrape:").await.unwrap();
        assert_eq!(keys, vec!["scrape:a".to_string(), "scrape:b".to_string()]);

        let deleted = store.delete(&keys).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get("scrape:a").await.unwrap().is_none());
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("scrape:a", &json!({"x": 1}), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.get("scrape:a").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("scrape:a").await.unwrap().is_none());
        assert!(store.scan_prefix("scrape:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_ttl_never_expires() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("scrape:a", &json!({"x": 1}), Duration::MAX)
            .await
            .unwrap();

        assert_eq!(store.get("scrape:a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.scan_prefix("scrape:").await.unwrap(), ["scrape:a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_prune_expired_entries() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("scrape:stale", &json!(1), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        store
            .set_with_ttl("scrape:fresh", &json!(2), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(read(&store.entries).len(), 1);
        assert!(read(&store.entries).contains_key("scrape:fresh"));
    }

    #[tokio::test]
    async fn test_metrics_append_assigns_ids() {
        let store = MemoryStore::new();
        let first = store.append(&MetricRecord::new("a", "p", "m")).await.unwrap();
        let second = store.append(&MetricRecord::new("b", "p", "m")).await.unwrap();

        assert_eq!((first, second), (1, 2));
        assert_eq!(store.metric_count(), 2);
    }

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..5 {
            let record = MetricRecord::new(format!("u{}", i), "p", "m")
                .at(now - chrono::Duration::minutes(5 - i));
            store.append(&record).await.unwrap();
        }

        let recent = store.recent(3).await.unwrap();
        let sources: Vec<_> = recent.iter().map(|r| r.source.as_str()).collect();
        assert_eq!(sources, ["u4", "u3", "u2"]);
    }

    #[tokio::test]
    async fn test_since_filters_window() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .append(&MetricRecord::new("old", "p", "m").at(now - chrono::Duration::days(10)))
            .await
            .unwrap();
        store.append(&MetricRecord::new("new", "p", "m")).await.unwrap();

        let window = store.since(Some(now - chrono::Duration::days(7))).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].source, "new");
        assert_eq!(store.since(None).await.unwrap().len(), 2);

        let stats = store.aggregate(now - chrono::Duration::days(7)).await.unwrap();
        assert_eq!(stats.total_attempts, 1);
    }
}
