use super::{ChatChoice, ChatResult, TokenUsage};
use crate::cache::CacheService;
use crate::storage::PromptTemplate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const KEY_PREFIX: &str = "response";

/// Identity of a template revision for cache keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptKey {
    pub public_id: String,
    pub revision: i64,
}

impl PromptKey {
    pub fn new(public_id: impl Into<String>, revision: i64) -> Self {
        Self {
            public_id: public_id.into(),
            revision,
        }
    }

    /// The id is JSON-quoted so ids containing `:` cannot share a prefix.
    fn prefix(public_id: &str) -> String {
        let quoted = serde_json::to_string(public_id).unwrap_or_default();
        format!("{}:{}:", KEY_PREFIX, quoted)
    }
}

impl From<&PromptTemplate> for PromptKey {
    fn from(prompt: &PromptTemplate) -> Self {
        Self::new(prompt.public_id.clone(), prompt.updated_at.timestamp_millis())
    }
}

/// What a cache hit replays to the caller, plus the provenance the call
/// record needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub choices: Vec<ChatChoice>,
    pub usage: TokenUsage,
    #[serde(default)]
    pub provider_id: Option<i64>,
    #[serde(default)]
    pub model: String,
}

impl CachedResult {
    pub fn new(result: &ChatResult, provider_id: Option<i64>, model: &str) -> Self {
        Self {
            choices: result.choices.clone(),
            usage: result.usage,
            provider_id,
            model: model.to_string(),
        }
    }
}

/// Short-circuits repeated invocations of the same template with the same
/// bindings. Backend failures degrade to a miss.
#[derive(Clone)]
pub struct ResponseCache {
    cache: Arc<dyn CacheService>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(cache: Arc<dyn CacheService>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// `BTreeMap` serializes in key order, so equal binding sets map to one key.
    pub fn key(prompt: &PromptKey, variables: &BTreeMap<String, String>) -> String {
        let bindings = serde_json::to_string(variables).unwrap_or_default();
        format!(
            "{}{}:{}",
            PromptKey::prefix(&prompt.public_id),
            prompt.revision,
            bindings
        )
    }

    pub async fn get(
        &self,
        prompt: &PromptKey,
        variables: &BTreeMap<String, String>,
    ) -> Option<CachedResult> {
        let key = Self::key(prompt, variables);
        match self.cache.get(&key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(cached) => Some(cached),
                Err(e) => {
                    tracing::warn!("Discarding undecodable cache entry {}: {}", key, e);
                    if let Err(e) = self.cache.delete(&key).await {
                        tracing::warn!("Failed to drop cache entry {}: {}", key, e);
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Response cache read failed, treating as miss: {}", e);
                None
            }
        }
    }

    pub async fn put(
        &self,
        prompt: &PromptKey,
        variables: &BTreeMap<String, String>,
        result: &CachedResult,
        ttl: Option<Duration>,
    ) {
        let key = Self::key(prompt, variables);
        let value = match serde_json::to_value(result) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to encode response for cache: {}", e);
                return;
            }
        };
        if let Err(e) = self.cache.set(&key, value, ttl.unwrap_or(self.ttl)).await {
            tracing::warn!("Response cache write failed: {}", e);
        }
    }

    /// Drop every cached response for a template, across revisions.
    pub async fn invalidate(&self, public_id: &str) {
        if let Err(e) = self.cache.delete_prefix(&PromptKey::prefix(public_id)).await {
            tracing::warn!("Failed to invalidate cached responses for {}: {}", public_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn result(text: &str) -> CachedResult {
        let chat = ChatResult {
            choices: vec![ChatChoice {
                index: 0,
                role: "assistant".to_string(),
                content: text.to_string(),
            }],
            usage: TokenUsage::new(10, 5),
        };
        CachedResult::new(&chat, Some(2), "gpt-4o")
    }

    fn cache() -> ResponseCache {
        ResponseCache::new(Arc::new(MemoryCache::new(100)), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_hit_after_put() {
        let cache = cache();
        let key = PromptKey::new("p1", 1);
        cache.put(&key, &vars(&[("a", "1")]), &result("hi"), None).await;

        let hit = cache.get(&key, &vars(&[("a", "1")])).await.unwrap();
        assert_eq!(hit.choices[0].content, "hi");
        assert_eq!(hit.usage.total, 15);
        assert_eq!(hit.provider_id, Some(2));
        assert_eq!(hit.model, "gpt-4o");
        assert!(cache.get(&key, &vars(&[("a", "2")])).await.is_none());
    }

    #[test]
    fn test_key_ignores_insertion_order() {
        let key = PromptKey::new("p1", 1);
        let mut forward = BTreeMap::new();
        forward.insert("a".to_string(), "1".to_string());
        forward.insert("b".to_string(), "2".to_string());
        let mut backward = BTreeMap::new();
        backward.insert("b".to_string(), "2".to_string());
        backward.insert("a".to_string(), "1".to_string());

        assert_eq!(ResponseCache::key(&key, &forward), ResponseCache::key(&key, &backward));
    }

    #[tokio::test]
    async fn test_new_revision_misses() {
        let cache = cache();
        let v = vars(&[]);
        cache.put(&PromptKey::new("p1", 1), &v, &result("old"), None).await;
        assert!(cache.get(&PromptKey::new("p1", 2), &v).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_drops_all_revisions() {
        let cache = cache();
        let v = vars(&[]);
        cache.put(&PromptKey::new("p1", 1), &v, &result("a"), None).await;
        cache.put(&PromptKey::new("p1", 2), &v, &result("b"), None).await;
        cache.put(&PromptKey::new("p2", 1), &v, &result("c"), None).await;

        cache.invalidate("p1").await;

        assert!(cache.get(&PromptKey::new("p1", 1), &v).await.is_none());
        assert!(cache.get(&PromptKey::new("p1", 2), &v).await.is_none());
        assert!(cache.get(&PromptKey::new("p2", 1), &v).await.is_some());
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_dropped() {
        let backend = Arc::new(MemoryCache::new(100));
        let cache = ResponseCache::new(backend.clone(), Duration::from_secs(60));
        let prompt = PromptKey::new("p1", 1);
        let key = ResponseCache::key(&prompt, &vars(&[]));
        backend
            .set(&key, serde_json::json!({ "unexpected": true }), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(cache.get(&prompt, &vars(&[])).await.is_none());
        assert!(backend.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_leaves_ids_sharing_a_prefix() {
        let cache = cache();
        let v = vars(&[]);
        cache.put(&PromptKey::new("a", 1), &v, &result("a"), None).await;
        cache.put(&PromptKey::new("a:b", 1), &v, &result("ab"), None).await;
        cache.put(&PromptKey::new("a\":1", 1), &v, &result("quoted"), None).await;

        cache.invalidate("a").await;

        assert!(cache.get(&PromptKey::new("a", 1), &v).await.is_none());
        assert!(cache.get(&PromptKey::new("a:b", 1), &v).await.is_some());
        assert!(cache.get(&PromptKey::new("a\":1", 1), &v).await.is_some());
    }

    struct BrokenCache;

    #[async_trait]
    impl CacheService for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<Value>> {
            anyhow::bail!("backend down")
        }
        async fn set(&self, _key: &str, _value: Value, _ttl: Duration) -> Result<()> {
            anyhow::bail!("backend down")
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            anyhow::bail!("backend down")
        }
        async fn delete_prefix(&self, _prefix: &str) -> Result<()> {
            anyhow::bail!("backend down")
        }
        async fn clear(&self) {}
    }

    #[tokio::test]
    async fn test_backend_errors_are_misses() {
        let cache = ResponseCache::new(Arc::new(BrokenCache), Duration::from_secs(60));
        let key = PromptKey::new("p1", 1);
        cache.put(&key, &vars(&[]), &result("x"), None).await;
        assert!(cache.get(&key, &vars(&[])).await.is_none());
    }
}
