//! Work items, per-item results, and batch reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// One unit of input to a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Position in the submitted batch (0..N-1)
    pub index: usize,

    /// Source identifier, usually a URL
    pub source: String,
}

impl WorkItem {
    pub fn new(index: usize, source: impl Into<String>) -> Self {
        Self {
            index,
            source: source.into(),
        }
    }

    /// Number a list of sources in submission order.
    pub fn from_sources<S: AsRef<str>>(sources: &[S]) -> Vec<WorkItem> {
        sources
            .iter()
            .enumerate()
            .map(|(index, source)| WorkItem::new(index, source.as_ref()))
            .collect()
    }
}

/// Terminal outcome of one pipeline.
///
/// A result carries data or an error, never both and never neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded { data: Value },
    Failed { error: String },
}

/// Result of one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    /// Original position in the batch
    pub index: usize,

    /// The item's source
    pub source: String,

    /// Data or error
    pub outcome: ItemOutcome,

    /// Wall time spent in the pipeline
    #[serde(with = "super::secs")]
    pub execution_time: Duration,

    /// Model that produced the data
    pub model_used: Option<String>,

    /// Extractor attempts made (0 for cache hits)
    pub fallback_attempts: usize,

    /// Served from the result cache
    pub cached: bool,

    /// Schema validation verdict (None when not validated)
    pub validation_passed: Option<bool>,

    /// When the pipeline finished
    pub completed_at: DateTime<Utc>,
}

impl ItemResult {
    /// A successful result.
    pub fn succeeded(item: &WorkItem, data: Value) -> Self {
        Self::with_outcome(item, ItemOutcome::Succeeded { data })
    }

    /// A failed result.
    pub fn failed(item: &WorkItem, error: impl Into<String>) -> Self {
        Self::with_outcome(
            item,
            ItemOutcome::Failed {
                error: error.into(),
            },
        )
    }

    fn with_outcome(item: &WorkItem, outcome: ItemOutcome) -> Self {
        Self {
            index: item.index,
            source: item.source.clone(),
            outcome,
            execution_time: Duration::ZERO,
            model_used: None,
            fallback_attempts: 0,
            cached: false,
            validation_passed: None,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Succeeded { .. })
    }

    /// Extracted data, on success.
    pub fn data(&self) -> Option<&Value> {
        match &self.outcome {
            ItemOutcome::Succeeded { data } => Some(data),
            ItemOutcome::Failed { .. } => None,
        }
    }

    /// Error message, on failure.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            ItemOutcome::Succeeded { .. } => None,
            ItemOutcome::Failed { error } => Some(error),
        }
    }
}

/// Results of a whole batch, in submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Identifier used in logs for this batch
    pub batch_id: Uuid,

    /// One result per item, sorted by index
    pub results: Vec<ItemResult>,

    /// Wall time for the batch
    #[serde(with = "super::secs")]
    pub total_time: Duration,
}

impl BatchReport {
    /// Number of successful items.
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    /// Number of failed items.
    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Number of items served from cache.
    pub fn cached(&self) -> usize {
        self.results.iter().filter(|r| r.cached).count()
    }

    /// Partial success counts as success.
    pub fn is_success(&self) -> bool {
        self.succeeded() > 0
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Progress event, emitted once per completed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Items completed so far, including this one (1..=total)
    pub completed: usize,

    /// Items in the batch
    pub total: usize,

    /// Source of the item that just completed
    pub source: String,

    /// Whether that item succeeded
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_sources_numbers_in_order() {
        let items = WorkItem::from_sources(&["a", "b", "c"]);
        assert_eq!(items.len(), 3);
        assert_eq!(items[2], WorkItem::new(2, "c"));
    }

    #[test]
    fn test_outcome_accessors_are_exclusive() {
        let item = WorkItem::new(0, "https://example.com");

        let ok = ItemResult::succeeded(&item, json!({"title": "Test"}));
        assert!(ok.is_success());
        assert_eq!(ok.data(), Some(&json!({"title": "Test"})));
        assert!(ok.error().is_none());

        let failed = ItemResult::failed(&item, "Timeout");
        assert!(!failed.is_success());
        assert!(failed.data().is_none());
        assert_eq!(failed.error(), Some("Timeout"));
        assert!(failed.model_used.is_none());
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let item = WorkItem::new(1, "u");
        let json = serde_json::to_value(ItemResult::failed(&item, "boom")).unwrap();
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["error"], "boom");
    }

    #[test]
    fn test_report_counts() {
        let items = WorkItem::from_sources(&["a", "b", "c"]);
        let mut cached = ItemResult::succeeded(&items[1], json!({"x": 1}));
        cached.cached = true;

        let report = BatchReport {
            batch_id: Uuid::now_v7(),
            results: vec![
                ItemResult::failed(&items[0], "boom"),
                cached,
                ItemResult::succeeded(&items[2], json!({"x": 2})),
            ],
            total_time: Duration::from_secs(1),
        };

        assert_eq!(report.len(), 3);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.cached(), 1);
        assert!(report.is_success());
    }
}
