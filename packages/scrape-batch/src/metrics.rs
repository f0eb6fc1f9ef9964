//! Attempt metrics.
//!
//! Every pipeline logs exactly one record, success or failure. Writes
//! never fail the pipeline: store errors are logged and swallowed.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::traits::store::MetricsStore;
use crate::types::metric::{AggregateStats, MetricRecord};

const CSV_HEADER: [&str; 13] = [
    "id",
    "timestamp",
    "source",
    "prompt_hash",
    "model",
    "execution_time_seconds",
    "token_count",
    "retry_count",
    "fallback_attempts",
    "cached",
    "validation_passed",
    "schema_used",
    "error",
];

/// Front door to a [`MetricsStore`].
#[derive(Clone)]
pub struct MetricsSink {
    store: Option<Arc<dyn MetricsStore>>,
}

impl MetricsSink {
    pub fn new(store: Arc<dyn MetricsStore>) -> Self {
        Self { store: Some(store) }
    }

    /// A sink that records nothing.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Append a record. Returns its id, or `None` if it was not stored.
    pub async fn log_attempt(&self, record: &MetricRecord) -> Option<i64> {
        let store = self.store.as_ref()?;
        match store.append(record).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(source = %record.source, error = %e, "Failed to log metric");
                None
            }
        }
    }

    /// Most recent records first.
    pub async fn recent_attempts(&self, limit: usize) -> Vec<MetricRecord> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        store.recent(limit).await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read recent metrics");
            Vec::new()
        })
    }

    /// Aggregates over the last `window_days` days.
    ///
    /// A window with no records (or an unavailable store) reports zero
    /// counts and undefined averages.
    pub async fn aggregate_stats(&self, window_days: u32) -> AggregateStats {
        let Some(store) = self.store.as_ref() else {
            return AggregateStats::default();
        };
        let since = Utc::now() - ChronoDuration::days(i64::from(window_days));
        store.aggregate(since).await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to aggregate metrics");
            AggregateStats::default()
        })
    }

    /// Write records (oldest first) to a CSV file.
    ///
    /// Returns the number of rows written. No file is written when
    /// there are no records.
    pub async fn export_csv(
        &self,
        path: impl AsRef<Path>,
        window_days: Option<u32>,
    ) -> StoreResult<usize> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("metrics store is disabled".to_string()))?;

        let since = window_days.map(|days| Utc::now() - ChronoDuration::days(i64::from(days)));
        let records = store.since(since).await?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut out = String::new();
        out.push_str(&CSV_HEADER.join(","));
        out.push('\n');
        for record in &records {
            write_row(&mut out, record);
        }

        let path = path.as_ref();
        tokio::fs::write(path, out).await?;
        info!(rows = records.len(), path = %path.display(), "Exported metrics");

        Ok(records.len())
    }
}

impl std::fmt::Debug for MetricsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsSink")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn write_row(out: &mut String, record: &MetricRecord) {
    let opt = |v: Option<String>| v.unwrap_or_default();
    let fields = [
        opt(record.id.map(|id| id.to_string())),
        record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        record.source.clone(),
        record.prompt_hash.clone(),
        record.model.clone(),
        record.execution_time.to_string(),
        opt(record.token_count.map(|t| t.to_string())),
        record.retry_count.to_string(),
        record.fallback_attempts.to_string(),
        record.cached.to_string(),
        opt(record.validation_passed.map(|v| v.to_string())),
        opt(record.schema_used.clone()),
        opt(record.error.clone()),
    ];

    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape(field));
    }
    out.push('\n');
}

fn escape(field: &str) -> std::borrow::Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\"")).into()
    } else {
        field.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use crate::testing::UnreachableStore;

    #[tokio::test]
    async fn test_log_and_read_back() {
        let sink = MetricsSink::new(Arc::new(MemoryStore::new()));

        let first = sink.log_attempt(&MetricRecord::new("a", "p", "m")).await;
        let second = sink.log_attempt(&MetricRecord::new("b", "p", "m")).await;
        assert_eq!((first, second), (Some(1), Some(2)));

        let recent = sink.recent_attempts(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].source, "b");
    }

    #[tokio::test]
    async fn test_store_failures_are_swallowed() {
        let sink = MetricsSink::new(Arc::new(UnreachableStore));

        assert!(sink.log_attempt(&MetricRecord::new("a", "p", "m")).await.is_none());
        assert!(sink.recent_attempts(10).await.is_empty());
        let stats = sink.aggregate_stats(7).await;
        assert_eq!(stats.total_attempts, 0);
        assert!(stats.avg_execution_time.is_none());
    }

    #[tokio::test]
    async fn test_aggregate_window() {
        let sink = MetricsSink::new(Arc::new(MemoryStore::new()));
        sink.log_attempt(&MetricRecord::new("old", "p", "m").at(Utc::now() - ChronoDuration::days(3)))
            .await;
        sink.log_attempt(&MetricRecord::new("new", "p", "m").with_execution_time(1.5))
            .await;

        let stats = sink.aggregate_stats(1).await;
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.avg_execution_time, Some(1.5));
        assert_eq!(sink.aggregate_stats(7).await.total_attempts, 2);
    }

    #[tokio::test]
    async fn test_export_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let sink = MetricsSink::new(Arc::new(MemoryStore::new()));

        sink.log_attempt(&MetricRecord::new("https://example.com/a", "p", "llama3.1"))
            .await;
        sink.log_attempt(
            &MetricRecord::new("https://example.com/b", "p", "llama3.1")
                .with_error("timeout after 30.0s, \"slow\""),
        )
        .await;

        let rows = sink.export_csv(&path, None).await.unwrap();
        assert_eq!(rows, 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,timestamp,source"));
        assert!(lines[1].contains("https://example.com/a"));
        assert!(lines[2].ends_with("\"timeout after 30.0s, \"\"slow\"\"\""));
    }

    #[tokio::test]
    async fn test_export_without_data_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        let sink = MetricsSink::new(Arc::new(MemoryStore::new()));

        assert_eq!(sink.export_csv(&path, Some(7)).await.unwrap(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_disabled_sink() {
        let sink = MetricsSink::disabled();
        assert!(sink.log_attempt(&MetricRecord::new("a", "p", "m")).await.is_none());
        assert!(matches!(
            sink.export_csv("unused.csv", None).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
