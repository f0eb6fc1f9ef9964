//! Schema validation of extracted data.
//!
//! Field-level rules belong to the application. This module fixes the
//! contract: a named schema either accepts the data (possibly
//! normalizing it) or rejects it with a message. `"none"` and unknown
//! schema names accept everything unchanged.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Schema name that disables validation.
pub const NO_SCHEMA: &str = "none";

/// Verdict of a validator.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    /// Data accepted; carries the normalized payload
    Valid(Value),
    /// Data rejected
    Invalid(String),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }
}

/// Validates extracted data against a named schema.
#[cfg_attr(test, mockall::automock)]
pub trait Validator: Send + Sync {
    fn validate(&self, data: &Value, schema: &str) -> Validation;
}

type SchemaCheck = dyn Fn(&Value) -> Result<Value, String> + Send + Sync;

/// Validator backed by a table of named checks.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<SchemaCheck>>,
}

impl SchemaRegistry {
    /// Create an empty registry (everything passes through).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a check under `name`.
    pub fn with_schema<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.schemas.insert(name.into(), Arc::new(check));
        self
    }

    /// Whether `name` refers to a registered schema.
    pub fn contains(&self, name: &str) -> bool {
        name != NO_SCHEMA && self.schemas.contains_key(name)
    }

    /// Registered schema names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.schemas.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schemas", &self.names())
            .finish()
    }
}

impl Validator for SchemaRegistry {
    fn validate(&self, data: &Value, schema: &str) -> Validation {
        if schema == NO_SCHEMA {
            return Validation::Valid(data.clone());
        }
        match self.schemas.get(schema) {
            Some(check) => match check(data) {
                Ok(normalized) => Validation::Valid(normalized),
                Err(reason) => Validation::Invalid(reason),
            },
            None => Validation::Valid(data.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new().with_schema("product", |data: &Value| {
            let name = data
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| "name is required".to_string())?;
            Ok(json!({ "name": name }))
        })
    }

    #[test]
    fn test_none_and_unknown_pass_through() {
        let registry = registry();
        let data = json!({"anything": true});

        assert_eq!(registry.validate(&data, "none"), Validation::Valid(data.clone()));
        assert_eq!(registry.validate(&data, "unknown"), Validation::Valid(data.clone()));
        assert!(!registry.contains("none"));
        assert!(!registry.contains("unknown"));
    }

    #[test]
    fn test_registered_schema_normalizes() {
        let result = registry().validate(&json!({"name": "  Widget  ", "extra": 1}), "product");
        assert_eq!(result, Validation::Valid(json!({"name": "Widget"})));
    }

    #[test]
    fn test_registered_schema_rejects() {
        let result = registry().validate(&json!({"price": 3}), "product");
        assert_eq!(result, Validation::Invalid("name is required".to_string()));
        assert!(!result.is_valid());
    }
}
