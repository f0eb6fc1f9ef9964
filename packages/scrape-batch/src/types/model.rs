//! Model configurations and the per-attempt extractor configuration.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// One entry in a fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name as the provider knows it (e.g. `llama3.1`)
    pub name: String,

    /// Provider prefix (e.g. `ollama`)
    pub provider: String,

    /// Provider endpoint
    pub base_url: String,

    /// Sampling temperature
    pub temperature: f32,

    /// Requested response format (e.g. `json`)
    pub response_format: String,
}

impl ModelConfig {
    /// Create a model config with the local Ollama defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            temperature: 0.0,
            response_format: "json".to_string(),
        }
    }

    /// Set the provider.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Set the provider endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// The default chain, ordered by speed and availability.
    ///
    /// Constructed fresh on every call; callers own their chain.
    pub fn default_chain() -> Vec<ModelConfig> {
        vec![
            ModelConfig::new("qwen2.5-coder:7b"),
            ModelConfig::new("llama3.1"),
            ModelConfig::new("deepseek-coder-v2"),
        ]
    }

    /// `provider/name`, the identifier extractors address the model by.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.provider, self.name)
    }

    /// Extractor parameters contributed by this model.
    pub fn to_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert(
            "llm".to_string(),
            json!({
                "model": self.qualified_name(),
                "temperature": self.temperature,
                "format": self.response_format,
                "base_url": self.base_url,
            }),
        );
        params
    }
}

/// Configuration handed to the extractor for a single attempt.
///
/// `params` starts from the model's own parameters; caller overrides
/// replace top-level keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// The model being attempted
    pub model: ModelConfig,

    /// Merged parameters
    pub params: Map<String, Value>,
}

impl ExtractorConfig {
    /// Overlay `overrides` on top of the model's parameters.
    pub fn merged(model: &ModelConfig, overrides: &Map<String, Value>) -> Self {
        let mut params = model.to_params();
        for (key, value) in overrides {
            params.insert(key.clone(), value.clone());
        }
        Self {
            model: model.clone(),
            params,
        }
    }

    /// Look up a merged parameter.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// HTTP headers the extractor should send, if any were merged in.
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.params
            .get("headers")
            .and_then(Value::as_object)
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chain_order() {
        let chain = ModelConfig::default_chain();
        let names: Vec<_> = chain.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["qwen2.5-coder:7b", "llama3.1", "deepseek-coder-v2"]);
        assert!(chain.iter().all(|m| m.provider == "ollama"));
    }

    #[test]
    fn test_to_params() {
        let model = ModelConfig::new("llama3.1").with_temperature(0.5);
        let params = model.to_params();
        assert_eq!(params["llm"]["model"], "ollama/llama3.1");
        assert_eq!(params["llm"]["temperature"], 0.5);
        assert_eq!(params["llm"]["format"], "json");
        assert_eq!(params["llm"]["base_url"], "http://localhost:11434");
    }

    #[test]
    fn test_overrides_replace_model_params() {
        let model = ModelConfig::new("llama3.1");
        let mut overrides = Map::new();
        overrides.insert("llm".to_string(), json!({"model": "custom"}));
        overrides.insert("extraction_mode".to_string(), json!(false));

        let config = ExtractorConfig::merged(&model, &overrides);
        assert_eq!(config.param("llm").unwrap()["model"], "custom");
        assert_eq!(config.param("extraction_mode"), Some(&json!(false)));
        assert_eq!(config.model.name, "llama3.1");
    }

    #[test]
    fn test_headers_accessor() {
        let mut overrides = Map::new();
        overrides.insert(
            "headers".to_string(),
            json!({"User-Agent": "test-agent", "DNT": "1"}),
        );
        let config = ExtractorConfig::merged(&ModelConfig::new("m"), &overrides);
        let headers = config.headers();
        assert_eq!(headers.get("User-Agent").map(String::as_str), Some("test-agent"));
        assert_eq!(headers.len(), 2);

        let bare = ExtractorConfig::merged(&ModelConfig::new("m"), &Map::new());
        assert!(bare.headers().is_empty());
    }
}
