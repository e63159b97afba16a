//! Two-level store: a fast local L1 in front of a shared L2.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::CacheStore;
use crate::pattern::KeyPattern;

/// L1/L2 composition.
///
/// Reads check L1 first and fall back to L2; an L2 hit is copied into L1 for
/// `promote_ttl`. Writes and deletes reach both tiers. L2 remains the source
/// of truth for other processes; entries promoted into L1 may outlive an L2
/// invalidation issued elsewhere by up to `promote_ttl`.
pub struct TieredStore {
    l1: Arc<dyn CacheStore>,
    l2: Arc<dyn CacheStore>,
    promote_ttl: Duration,
}

impl TieredStore {
    pub fn new(l1: Arc<dyn CacheStore>, l2: Arc<dyn CacheStore>, promote_ttl: Duration) -> Self {
        Self {
            l1,
            l2,
            promote_ttl,
        }
    }

    pub fn l1(&self) -> &Arc<dyn CacheStore> {
        &self.l1
    }

    pub fn l2(&self) -> &Arc<dyn CacheStore> {
        &self.l2
    }
}

#[async_trait]
impl CacheStore for TieredStore {
    async fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(value) = self.l1.get(key).await {
            debug!(key, tier = "l1", "tiered hit");
            return Some(value);
        }

        let value = self.l2.get(key).await?;
        debug!(key, tier = "l2", "tiered hit, promoting to l1");
        self.l1.set(key, value.clone(), self.promote_ttl).await;
        Some(value)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> bool {
        let l1 = self.l1.set(key, value.clone(), ttl.min(self.promote_ttl)).await;
        let l2 = self.l2.set(key, value, ttl).await;
        l1 || l2
    }

    async fn delete(&self, key: &str) -> u64 {
        let l1 = self.l1.delete(key).await;
        let l2 = self.l2.delete(key).await;
        l1.max(l2)
    }

    async fn flush(&self) {
        self.l1.flush().await;
        self.l2.flush().await;
    }

    async fn keys(&self, pattern: Option<&KeyPattern>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();

        for key in self
            .l1
            .keys(pattern)
            .await
            .into_iter()
            .chain(self.l2.keys(pattern).await)
        {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }

        keys
    }

    async fn is_ready(&self) -> bool {
        self.l1.is_ready().await || self.l2.is_ready().await
    }

    async fn close(&self) {
        self.l1.close().await;
        self.l2.close().await;
    }

    fn name(&self) -> &'static str {
        "tiered"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NoopStore};

    fn tiers() -> (Arc<MemoryStore>, Arc<MemoryStore>, TieredStore) {
        let l1 = Arc::new(MemoryStore::default());
        let l2 = Arc::new(MemoryStore::default());
        let tiered = TieredStore::new(l1.clone(), l2.clone(), Duration::from_secs(30));
        (l1, l2, tiered)
    }

    #[tokio::test]
    async fn l2_hit_is_promoted_into_l1() {
        let (l1, l2, tiered) = tiers();
        l2.set("item:1", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await;

        assert!(l1.get("item:1").await.is_none());
        assert_eq!(tiered.get("item:1").await, Some(Bytes::from_static(b"v")));
        assert_eq!(l1.get("item:1").await, Some(Bytes::from_static(b"v")));
    }

    #[tokio::test(start_paused = true)]
    async fn l1_copy_never_outlives_promote_ttl() {
        let (l1, l2, tiered) = tiers();
        tiered
            .set("item:1", Bytes::from_static(b"v"), Duration::from_secs(600))
            .await;

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(l1.get("item:1").await.is_none());
        assert!(l2.get("item:1").await.is_some());
    }

    #[tokio::test]
    async fn delete_reaches_both_tiers_and_keys_are_deduplicated() {
        let (l1, l2, tiered) = tiers();
        let ttl = Duration::from_secs(60);
        tiered.set("item:1", Bytes::from_static(b"a"), ttl).await;
        l2.set("item:2", Bytes::from_static(b"b"), ttl).await;

        let mut keys = tiered.keys(Some(&KeyPattern::new("item:*"))).await;
        keys.sort();
        assert_eq!(keys, vec!["item:1".to_string(), "item:2".to_string()]);

        assert_eq!(tiered.delete("item:1").await, 1);
        assert!(l1.get("item:1").await.is_none());
        assert!(l2.get("item:1").await.is_none());
    }

    #[tokio::test]
    async fn unavailable_l2_degrades_to_l1_only() {
        let l1 = Arc::new(MemoryStore::default());
        let tiered = TieredStore::new(l1.clone(), Arc::new(NoopStore::new()), Duration::from_secs(30));

        assert!(
            tiered
                .set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
                .await
        );
        assert_eq!(tiered.get("k").await, Some(Bytes::from_static(b"v")));
        assert!(tiered.is_ready().await);
    }
}
