//! In-memory [`CachePort`] with per-entry expiry.
//!
//! Entries live in a `DashMap` keyed by the engine's cache key. Expired
//! entries are evicted lazily on lookup, or in bulk by [`InMemoryCache::purge_expired`].

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use taskweave_core::workflow::cache::{CacheContext, CacheError, CacheOptions, CachePort};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

/// Process-local result cache. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<DashMap<String, Entry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live and not-yet-evicted expired entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl CachePort for InMemoryCache {
    async fn get(&self, key: &str, ctx: &CacheContext) -> Result<Option<Value>, CacheError> {
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.expires_at <= now);
        if removed.is_some() {
            tracing::debug!(key, step_id = ctx.step_id.as_str(), "cache entry expired");
            return Ok(None);
        }
        Ok(self.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, options: CacheOptions) -> Result<(), CacheError> {
        let Some(expires_at) = Instant::now().checked_add(options.ttl) else {
            return Err(CacheError::Backend(format!(
                "ttl of {}s is out of range",
                options.ttl.as_secs()
            )));
        };
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use taskweave_types::workflow::DataClassification;

    fn ctx() -> CacheContext {
        CacheContext {
            workflow_id: "fx".to_string(),
            step_id: "rates".to_string(),
            classification: DataClassification::Internal,
        }
    }

    fn options(ttl: Duration) -> CacheOptions {
        CacheOptions {
            ttl,
            classification: DataClassification::Internal,
        }
    }

    #[tokio::test]
    async fn stores_and_returns_values() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.get("k", &ctx()).await.unwrap(), None);

        cache
            .set("k", json!({"rate": 1.08}), options(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(cache.get("k", &ctx()).await.unwrap(), Some(json!({"rate": 1.08})));

        let shared = cache.clone();
        assert_eq!(shared.len(), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_on_lookup() {
        let cache = InMemoryCache::new();
        cache
            .set("k", json!(1), options(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k", &ctx()).await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let cache = InMemoryCache::new();
        cache.set("old", json!(1), options(Duration::ZERO)).await.unwrap();
        cache
            .set("new", json!(2), options(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_an_error() {
        let cache = InMemoryCache::new();
        let err = cache
            .set("k", json!(1), options(Duration::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Backend(_)));
    }
}
