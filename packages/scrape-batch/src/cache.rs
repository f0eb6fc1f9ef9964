//! Content-addressed result cache.
//!
//! Keys are derived from `(source, prompt, params)` so identical logical
//! requests collide and requests differing in any parameter do not.
//! The cache fails closed: an unreachable store at connect time disables
//! it, and store errors afterwards read as misses or failed writes.
//! Nothing here ever returns an error into a pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::traits::store::CacheStore;

/// Namespace prefix of every key written by this cache.
pub const KEY_PREFIX: &str = "scrape:";

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Derive the cache key for a request.
///
/// Hashes the sorted-key JSON of `{url, prompt, ..params}` and keeps the
/// first 16 hex chars of the SHA-256.
pub fn cache_key(source: &str, prompt: &str, params: &Map<String, Value>) -> String {
    let mut key_data = Map::new();
    key_data.insert("url".to_string(), Value::String(source.to_string()));
    key_data.insert("prompt".to_string(), Value::String(prompt.to_string()));
    for (k, v) in params {
        key_data.insert(k.clone(), v.clone());
    }

    // serde_json::Map is ordered by key, so this serialization is canonical
    let canonical = Value::Object(key_data).to_string();

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}{}", KEY_PREFIX, &digest[..16])
}

/// Cache counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub hit_count: u64,
    pub miss_count: u64,
    /// Live entries under [`KEY_PREFIX`]
    pub total_entries: usize,
}

impl CacheStats {
    /// Hits as a fraction of lookups, if any lookups happened.
    pub fn hit_rate(&self) -> Option<f64> {
        let lookups = self.hit_count + self.miss_count;
        (lookups > 0).then(|| self.hit_count as f64 / lookups as f64)
    }
}

/// Result cache over a [`CacheStore`].
pub struct ResultCache {
    store: Option<Arc<dyn CacheStore>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    /// Connect to a store. If it cannot be reached the cache is disabled.
    pub async fn connect(store: Arc<dyn CacheStore>) -> Self {
        let store = match store.ping().await {
            Ok(()) => {
                info!("Result cache connected");
                Some(store)
            }
            Err(e) => {
                warn!(error = %e, "Cache store unreachable, caching disabled");
                None
            }
        };
        Self::from_parts(store)
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::from_parts(None)
    }

    fn from_parts(store: Option<Arc<dyn CacheStore>>) -> Self {
        Self {
            store,
            ttl: DEFAULT_TTL,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Set the default TTL used when [`ResultCache::set`] gets none.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Look up a cached result.
    pub async fn get(&self, source: &str, prompt: &str, params: &Map<String, Value>) -> Option<Value> {
        let store = self.store.as_ref()?;
        let key = cache_key(source, prompt, params);

        match store.get(&key).await {
            Ok(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(source = %source, key = %key, "Cache hit");
                Some(value)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(source = %source, key = %key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(source = %source, error = %e, "Cache read failed");
                None
            }
        }
    }

    /// Store a result. Returns whether it was written.
    pub async fn set(
        &self,
        source: &str,
        prompt: &str,
        data: &Value,
        ttl: Option<Duration>,
        params: &Map<String, Value>,
    ) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let key = cache_key(source, prompt, params);

        match store.set_with_ttl(&key, data, ttl.unwrap_or(self.ttl)).await {
            Ok(()) => {
                debug!(source = %source, key = %key, "Cached result");
                true
            }
            Err(e) => {
                warn!(source = %source, error = %e, "Cache write failed");
                false
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let total_entries = match &self.store {
            Some(store) => store
                .scan_prefix(KEY_PREFIX)
                .await
                .map(|keys| keys.len())
                .unwrap_or(0),
            None => 0,
        };

        CacheStats {
            enabled: self.is_enabled(),
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            total_entries,
        }
    }

    /// Delete every entry under [`KEY_PREFIX`]. Other keys are untouched.
    pub async fn clear_all(&self) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };

        let cleared = async {
            let keys = store.scan_prefix(KEY_PREFIX).await?;
            store.delete(&keys).await
        };
        match cleared.await {
            Ok(count) => {
                info!(count, "Cleared cached results");
                true
            }
            Err(e) => {
                warn!(error = %e, "Cache clear failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("enabled", &self.is_enabled())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use crate::testing::UnreachableStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn params(model: &str, schema: &str) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("model".to_string(), json!(model));
        params.insert("schema".to_string(), json!(schema));
        params
    }

    #[test]
    fn test_key_format() {
        let key = cache_key("https://example.com", "Extract title", &Map::new());
        assert!(key.starts_with("scrape:"));
        assert_eq!(key.len(), "scrape:".len() + 16);
        assert!(key["scrape:".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_ignores_param_insertion_order() {
        let mut a = Map::new();
        a.insert("model".to_string(), json!("m"));
        a.insert("schema".to_string(), json!("s"));
        let mut b = Map::new();
        b.insert("schema".to_string(), json!("s"));
        b.insert("model".to_string(), json!("m"));

        assert_eq!(cache_key("u", "p", &a), cache_key("u", "p", &b));
    }

    proptest! {
        #[test]
        fn prop_key_is_deterministic(source in ".*", prompt in ".*", model in "[a-z0-9.:-]{1,20}") {
            let params = params(&model, "none");
            prop_assert_eq!(
                cache_key(&source, &prompt, &params),
                cache_key(&source, &prompt, &params)
            );
        }

        #[test]
        fn prop_differing_source_changes_key(source in "[a-z]{1,30}", suffix in "[a-z]{1,5}") {
            let params = params("m", "none");
            let other = format!("{}{}", source, suffix);
            prop_assert_ne!(cache_key(&source, "p", &params), cache_key(&other, "p", &params));
        }

        #[test]
        fn prop_differing_params_change_key(a in "[a-z]{1,10}", b in "[a-z]{1,10}") {
            prop_assume!(a != b);
            prop_assert_ne!(
                cache_key("u", "p", &params(&a, "none")),
                cache_key("u", "p", &params(&b, "none"))
            );
        }
    }

    #[tokio::test]
    async fn test_get_set_counts_hits_and_misses() {
        let cache = ResultCache::connect(Arc::new(MemoryStore::new())).await;
        let params = params("llama3.1", "none");
        assert!(cache.is_enabled());

        assert!(cache.get("u", "p", &params).await.is_none());
        assert!(cache.set("u", "p", &json!({"title": "T"}), None, &params).await);
        assert_eq!(cache.get("u", "p", &params).await, Some(json!({"title": "T"})));

        let stats = cache.stats().await;
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.hit_rate(), Some(0.5));
    }

    #[tokio::test]
    async fn test_different_params_do_not_collide() {
        let cache = ResultCache::connect(Arc::new(MemoryStore::new())).await;
        cache
            .set("u", "p", &json!({"x": 1}), None, &params("a", "none"))
            .await;

        assert!(cache.get("u", "p", &params("b", "none")).await.is_none());
        assert!(cache.get("u", "p", &params("a", "product")).await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_closed() {
        let cache = ResultCache::connect(Arc::new(UnreachableStore)).await;

        assert!(!cache.is_enabled());
        assert!(cache.get("u", "p", &Map::new()).await.is_none());
        assert!(!cache.set("u", "p", &json!({"x": 1}), None, &Map::new()).await);
        assert!(!cache.clear_all().await);

        let stats = cache.stats().await;
        assert!(!stats.enabled);
        assert_eq!((stats.hit_count, stats.miss_count, stats.total_entries), (0, 0, 0));
        assert!(stats.hit_rate().is_none());
    }

    #[tokio::test]
    async fn test_clear_all_keeps_foreign_keys() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_with_ttl("session:1", &json!("keep"), Duration::from_secs(60))
            .await
            .unwrap();

        let cache = ResultCache::connect(store.clone()).await;
        cache.set("a", "p", &json!(1), None, &Map::new()).await;
        cache.set("b", "p", &json!(2), None, &Map::new()).await;
        assert_eq!(cache.stats().await.total_entries, 2);

        assert!(cache.clear_all().await);
        assert_eq!(cache.stats().await.total_entries, 0);
        assert!(store.get("session:1").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = ResultCache::connect(Arc::new(MemoryStore::new()))
            .await
            .with_ttl(Duration::from_secs(60));

        cache.set("u", "p", &json!(1), None, &Map::new()).await;
        cache
            .set("v", "p", &json!(2), Some(Duration::from_secs(600)), &Map::new())
            .await;
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(cache.get("u", "p", &Map::new()).await.is_none());
        assert_eq!(cache.get("v", "p", &Map::new()).await, Some(json!(2)));
    }
}
