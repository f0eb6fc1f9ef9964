//! Sequential model fallback.
//!
//! Tries each model of an ordered chain against the extractor until one
//! returns a non-empty result. Attempts within one invocation are
//! strictly sequential; parallelism across items is the orchestrator's
//! business.

use serde_json::{Map, Value};
use std::sync::{PoisonError, RwLock};
use tracing::{info, warn};

use crate::error::{ExtractionError, ExtractionResult};
use crate::traits::extractor::{is_empty_result, Extractor};
use crate::types::model::{ExtractorConfig, ModelConfig};

/// Data produced by a successful fallback run.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackSuccess {
    pub data: Value,

    /// Name of the model that produced `data`
    pub model_used: String,

    /// 1-based position of that model in the chain
    pub attempts: usize,
}

/// Walks a fallback chain.
#[derive(Debug)]
pub struct FallbackExecutor {
    chain: Vec<ModelConfig>,
    last_successful: RwLock<Option<String>>,
}

impl Default for FallbackExecutor {
    fn default() -> Self {
        Self::new(ModelConfig::default_chain())
    }
}

impl FallbackExecutor {
    /// Create an executor. An empty chain is replaced by
    /// [`ModelConfig::default_chain`].
    pub fn new(chain: Vec<ModelConfig>) -> Self {
        let chain = if chain.is_empty() {
            ModelConfig::default_chain()
        } else {
            chain
        };
        Self {
            chain,
            last_successful: RwLock::new(None),
        }
    }

    /// The chain, primary model first.
    pub fn chain(&self) -> &[ModelConfig] {
        &self.chain
    }

    /// The primary model.
    pub fn primary(&self) -> &ModelConfig {
        // new() guarantees a non-empty chain
        &self.chain[0]
    }

    /// Model names in chain order.
    pub fn available_models(&self) -> Vec<String> {
        self.chain.iter().map(|m| m.name.clone()).collect()
    }

    /// Model that most recently produced a result.
    pub fn last_successful_model(&self) -> Option<String> {
        self.last_successful
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_success(&self, model: &str) {
        *self
            .last_successful
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(model.to_string());
    }

    /// One attempt against one model. Errors and empty results both fail.
    async fn attempt(
        &self,
        extractor: &dyn Extractor,
        model: &ModelConfig,
        prompt: &str,
        source: &str,
        overrides: &Map<String, Value>,
    ) -> ExtractionResult<Value> {
        let config = ExtractorConfig::merged(model, overrides);
        let data = extractor
            .extract(prompt, source, &config)
            .await
            .map_err(ExtractionError::Extractor)?;

        if is_empty_result(&data) {
            return Err(ExtractionError::EmptyResult {
                model: model.name.clone(),
            });
        }
        Ok(data)
    }

    /// Try every model in order, returning on the first success.
    pub async fn execute_with_fallback(
        &self,
        extractor: &dyn Extractor,
        prompt: &str,
        source: &str,
        overrides: &Map<String, Value>,
    ) -> ExtractionResult<FallbackSuccess> {
        let mut last_error = None;

        for (idx, model) in self.chain.iter().enumerate() {
            match self.attempt(extractor, model, prompt, source, overrides).await {
                Ok(data) => {
                    if idx > 0 {
                        info!(
                            source = %source,
                            model = %model.name,
                            attempt = idx + 1,
                            "Fallback model succeeded"
                        );
                    }
                    self.record_success(&model.name);
                    return Ok(FallbackSuccess {
                        data,
                        model_used: model.name.clone(),
                        attempts: idx + 1,
                    });
                }
                Err(e) => {
                    warn!(
                        source = %source,
                        model = %model.name,
                        attempt = idx + 1,
                        of = self.chain.len(),
                        error = %e,
                        "Model attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(ExtractionError::AllModelsFailed {
            attempts: self.chain.len(),
            models: self.available_models(),
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no models configured".to_string()),
        })
    }

    /// Single attempt against the primary model, no fallback.
    pub async fn execute_single(
        &self,
        extractor: &dyn Extractor,
        prompt: &str,
        source: &str,
        overrides: &Map<String, Value>,
    ) -> ExtractionResult<FallbackSuccess> {
        let model = self.primary();
        let data = self
            .attempt(extractor, model, prompt, source, overrides)
            .await?;
        self.record_success(&model.name);
        Ok(FallbackSuccess {
            data,
            model_used: model.name.clone(),
            attempts: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBehavior, MockExtractor};
    use serde_json::json;

    fn chain(names: &[&str]) -> Vec<ModelConfig> {
        names.iter().map(|n| ModelConfig::new(*n)).collect()
    }

    #[test]
    fn test_empty_chain_uses_default() {
        let executor = FallbackExecutor::new(Vec::new());
        assert_eq!(
            executor.available_models(),
            ["qwen2.5-coder:7b", "llama3.1", "deepseek-coder-v2"]
        );
        assert_eq!(executor.primary().name, "qwen2.5-coder:7b");
    }

    #[tokio::test]
    async fn test_first_model_success() {
        let extractor = MockExtractor::new().returning(json!({"title": "Test"}));
        let executor = FallbackExecutor::new(chain(&["a", "b"]));

        let success = executor
            .execute_with_fallback(&extractor, "p", "https://example.com", &Map::new())
            .await
            .unwrap();

        assert_eq!(success.model_used, "a");
        assert_eq!(success.attempts, 1);
        assert_eq!(success.data, json!({"title": "Test"}));
        assert_eq!(extractor.call_count(), 1);
        assert_eq!(executor.last_successful_model().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_falls_back_to_second_model() {
        let extractor = MockExtractor::new()
            .returning(json!({"title": "Test"}))
            .with_model("a", MockBehavior::Fail("connection refused".into()));
        let executor = FallbackExecutor::new(chain(&["a", "b"]));

        let success = executor
            .execute_with_fallback(&extractor, "p", "u", &Map::new())
            .await
            .unwrap();

        assert_eq!(success.model_used, "b");
        assert_eq!(success.attempts, 2);
        let models: Vec<_> = extractor.calls().into_iter().map(|c| c.model).collect();
        assert_eq!(models, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_empty_result_counts_as_failure() {
        let extractor = MockExtractor::new()
            .returning(json!({"title": "Test"}))
            .with_model("a", MockBehavior::Empty);
        let executor = FallbackExecutor::new(chain(&["a", "b"]));

        let success = executor
            .execute_with_fallback(&extractor, "p", "u", &Map::new())
            .await
            .unwrap();
        assert_eq!(success.model_used, "b");
    }

    #[tokio::test]
    async fn test_all_models_failed_names_every_model() {
        let extractor = MockExtractor::new()
            .with_model("a", MockBehavior::Fail("boom a".into()))
            .with_model("b", MockBehavior::Fail("boom b".into()));
        let executor = FallbackExecutor::new(chain(&["a", "b"]));

        let err = executor
            .execute_with_fallback(&extractor, "p", "u", &Map::new())
            .await
            .unwrap_err();

        match &err {
            ExtractionError::AllModelsFailed {
                attempts,
                models,
                last_error,
            } => {
                assert_eq!(*attempts, 2);
                assert_eq!(models, &["a", "b"]);
                assert!(last_error.contains("boom b"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("(a, b)"));
        assert!(executor.last_successful_model().is_none());
    }

    #[tokio::test]
    async fn test_overrides_reach_extractor() {
        let extractor = MockExtractor::new();
        let executor = FallbackExecutor::new(chain(&["a"]));
        let mut overrides = Map::new();
        overrides.insert("headers".to_string(), json!({"User-Agent": "ua"}));

        executor
            .execute_with_fallback(&extractor, "p", "u", &overrides)
            .await
            .unwrap();

        let call = extractor.calls().remove(0);
        assert_eq!(call.headers.get("User-Agent").map(String::as_str), Some("ua"));
    }

    #[tokio::test]
    async fn test_single_attempt_does_not_fall_back() {
        let extractor = MockExtractor::new()
            .returning(json!({"x": 1}))
            .with_model("a", MockBehavior::Fail("down".into()));
        let executor = FallbackExecutor::new(chain(&["a", "b"]));

        let err = executor
            .execute_single(&extractor, "p", "u", &Map::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ExtractionError::Extractor(_)));
        assert_eq!(extractor.call_count(), 1);
    }
}
