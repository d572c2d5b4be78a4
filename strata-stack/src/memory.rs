//! In-memory reference layer.
//!
//! Backs the test suite and serves as the template for real backends. Uses a
//! plain `RwLock<HashMap>`; eviction policy beyond TTL cleanup is a concern
//! for richer backends.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use strata_core::{CacheEntry, Clock, StrataResult, SystemClock};

use crate::layer::{CacheLayer, CacheValue};

/// In-memory cache layer.
///
/// Always available. `cleanup` sweeps entries whose expiry has passed
/// according to the layer's clock.
pub struct MemoryCacheLayer<T> {
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
    clock: Arc<dyn Clock>,
}

impl<T: CacheValue> MemoryCacheLayer<T> {
    /// Create a layer on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a layer with an injected clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// True when the layer holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: CacheValue> Default for MemoryCacheLayer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: CacheValue> CacheLayer<T> for MemoryCacheLayer<T> {
    async fn get(&self, key: &str) -> StrataResult<Option<CacheEntry<T>>> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, entry: CacheEntry<T>) -> StrataResult<()> {
        self.entries.write().unwrap().insert(key.to_string(), entry);
        Ok(())
    }

    async fn evict(&self, key: &str) -> StrataResult<()> {
        self.entries.write().unwrap().remove(key);
        Ok(())
    }

    async fn flush(&self) -> StrataResult<()> {
        self.entries.write().unwrap().clear();
        Ok(())
    }

    async fn cleanup(&self) -> StrataResult<()> {
        let now = self.clock.now();
        self.entries
            .write()
            .unwrap()
            .retain(|_, entry| !entry.is_expired(now));
        Ok(())
    }

    async fn is_available(&self, _key: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;

    #[tokio::test]
    async fn set_get_evict_roundtrip() {
        let layer = MemoryCacheLayer::new();
        let entry = CacheEntry::with_ttl(7, Utc::now(), Duration::from_secs(60));

        assert!(layer.get("k").await.unwrap().is_none());

        layer.set("k", entry.clone()).await.unwrap();
        assert_eq!(layer.get("k").await.unwrap(), Some(entry));

        layer.evict("k").await.unwrap();
        assert!(layer.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_returns_expired_entries_raw() {
        let layer = MemoryCacheLayer::new();
        let expired = CacheEntry::new(1, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());

        layer.set("k", expired.clone()).await.unwrap();
        assert_eq!(layer.get("k").await.unwrap(), Some(expired));
    }

    #[tokio::test]
    async fn flush_empties_the_layer() {
        let layer = MemoryCacheLayer::new();
        for i in 0..5 {
            let entry = CacheEntry::with_ttl(i, Utc::now(), Duration::from_secs(60));
            layer.set(&format!("k{i}"), entry).await.unwrap();
        }
        assert_eq!(layer.len(), 5);

        layer.flush().await.unwrap();
        assert!(layer.is_empty());
    }

    #[tokio::test]
    async fn cleanup_sweeps_only_expired() {
        let layer = MemoryCacheLayer::new();
        let now = Utc::now();

        layer
            .set("dead", CacheEntry::new(1, now - ChronoDuration::seconds(1)))
            .await
            .unwrap();
        layer
            .set("live", CacheEntry::new(2, now + ChronoDuration::seconds(60)))
            .await
            .unwrap();

        layer.cleanup().await.unwrap();

        assert!(layer.get("dead").await.unwrap().is_none());
        assert!(layer.get("live").await.unwrap().is_some());
    }
}
