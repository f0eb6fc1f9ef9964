//! Extractor trait for the external content-extraction call.
//!
//! The extractor is opaque to this library: it takes a prompt, a source
//! and a model configuration and returns structured data or fails. It
//! may take tens of seconds.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::BoxError;
use crate::types::model::ExtractorConfig;

/// External extraction call.
///
/// Implementations wrap a specific scraping/LLM stack. They must not
/// block the async runtime; wrap synchronous code in
/// [`BlockingExtractor`].
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract structured data from `source` according to `prompt`.
    async fn extract(
        &self,
        prompt: &str,
        source: &str,
        config: &ExtractorConfig,
    ) -> Result<Value, BoxError>;
}

#[async_trait]
impl<E: Extractor + ?Sized> Extractor for Arc<E> {
    async fn extract(
        &self,
        prompt: &str,
        source: &str,
        config: &ExtractorConfig,
    ) -> Result<Value, BoxError> {
        (**self).extract(prompt, source, config).await
    }
}

/// Adapter running a synchronous extraction function on tokio's
/// blocking pool, so a slow call never stalls sibling pipelines.
pub struct BlockingExtractor<F> {
    func: Arc<F>,
}

impl<F> BlockingExtractor<F>
where
    F: Fn(&str, &str, &ExtractorConfig) -> Result<Value, BoxError> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl<F> Extractor for BlockingExtractor<F>
where
    F: Fn(&str, &str, &ExtractorConfig) -> Result<Value, BoxError> + Send + Sync + 'static,
{
    async fn extract(
        &self,
        prompt: &str,
        source: &str,
        config: &ExtractorConfig,
    ) -> Result<Value, BoxError> {
        let func = Arc::clone(&self.func);
        let prompt = prompt.to_string();
        let source = source.to_string();
        let config = config.clone();

        tokio::task::spawn_blocking(move || func(&prompt, &source, &config))
            .await
            .map_err(|e| Box::new(e) as BoxError)?
    }
}

/// Whether an extractor result counts as "nothing extracted".
pub fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::model::ModelConfig;
    use serde_json::json;

    #[test]
    fn test_empty_results() {
        assert!(is_empty_result(&Value::Null));
        assert!(is_empty_result(&json!({})));
        assert!(is_empty_result(&json!([])));
        assert!(is_empty_result(&json!("  ")));
        assert!(!is_empty_result(&json!({"title": "x"})));
        assert!(!is_empty_result(&json!(0)));
        assert!(!is_empty_result(&json!(false)));
    }

    #[tokio::test]
    async fn test_blocking_extractor_runs_closure() {
        let extractor = BlockingExtractor::new(|prompt: &str, source: &str, config: &ExtractorConfig| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok(json!({
                "prompt": prompt,
                "source": source,
                "model": config.model.name,
            }))
        });

        let config = ExtractorConfig::merged(&ModelConfig::new("llama3.1"), &Default::default());
        let data = extractor
            .extract("title", "https://example.com", &config)
            .await
            .unwrap();

        assert_eq!(data["source"], "https://example.com");
        assert_eq!(data["model"], "llama3.1");
    }

    #[tokio::test]
    async fn test_blocking_extractor_propagates_errors() {
        let extractor = BlockingExtractor::new(|_: &str, _: &str, _: &ExtractorConfig| {
            Err("connection refused".into())
        });

        let config = ExtractorConfig::merged(&ModelConfig::new("m"), &Default::default());
        let err = extractor.extract("p", "s", &config).await.unwrap_err();
        assert_eq!(err.to_string(), "connection refused");
    }
}
