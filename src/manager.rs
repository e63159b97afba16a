//! Cache-aside orchestration over a single [`CacheStore`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{BackendKind, Settings};
use crate::lock::lock_or_recover;
use crate::pattern::KeyPattern;
use crate::store::{CacheStore, MemoryStore, NoopStore, RedisStore, TieredStore};
use crate::telemetry::{METRIC_HIT_TOTAL, METRIC_INVALIDATED_TOTAL, METRIC_MISS_TOTAL};

const SOURCE: &str = "manager";
const PATTERN_MEMO_LIMIT: usize = 256;

/// Hit/miss counters plus the number of live keys at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub key_count: u64,
}

impl CacheStats {
    /// `hits / (hits + misses)`, or 0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Orchestrates one store: typed get/set, cache-aside, pattern deletes and
/// instrumentation.
///
/// Construct once at startup, share as `Arc<CacheManager>`, and call
/// [`close`](Self::close) on shutdown.
///
/// [`get_or_set`](Self::get_or_set) does not collapse concurrent misses for
/// the same key: each caller runs its producer and the last write wins.
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    patterns: DashMap<String, KeyPattern>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            enabled: true,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            patterns: DashMap::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// A manager that never stores anything; every lookup recomputes.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Arc::new(NoopStore::new()))
        }
    }

    /// Build the backend described by `settings`.
    ///
    /// A shared store that cannot be reached never prevents startup: a
    /// `redis` backend degrades to [`NoopStore`], a `tiered` backend to its
    /// in-process tier.
    pub async fn from_settings(settings: &Settings) -> Self {
        let cache = &settings.cache;
        if !cache.enabled {
            info!(source = SOURCE, "caching disabled by configuration");
            return Self::disabled();
        }

        let memory = || -> (Arc<dyn CacheStore>, Option<JoinHandle<()>>) {
            let store = Arc::new(MemoryStore::new(cache.max_entries));
            let sweeper = cache
                .sweep_interval
                .map(|interval| store.spawn_sweeper(interval));
            let store: Arc<dyn CacheStore> = store;
            (store, sweeper)
        };

        let (store, sweeper) = match cache.backend {
            BackendKind::Memory => memory(),
            BackendKind::Redis => {
                let store: Arc<dyn CacheStore> = match connect_redis(settings).await {
                    Some(redis) => Arc::new(redis),
                    None => {
                        warn!(
                            source = SOURCE,
                            fallback = "noop",
                            "shared store unavailable, caching degraded to always recompute"
                        );
                        Arc::new(NoopStore::new())
                    }
                };
                (store, None)
            }
            BackendKind::Tiered => {
                let (l1, sweeper) = memory();
                let store: Arc<dyn CacheStore> = match connect_redis(settings).await {
                    Some(redis) => {
                        Arc::new(TieredStore::new(l1, Arc::new(redis), cache.l1_promote_ttl))
                    }
                    None => {
                        warn!(
                            source = SOURCE,
                            fallback = "memory",
                            "shared store unavailable, serving from the local tier only"
                        );
                        l1
                    }
                };
                (store, sweeper)
            }
        };

        info!(source = SOURCE, store = store.name(), "cache manager ready");

        let manager = Self::new(store);
        *lock_or_recover(&manager.sweeper, SOURCE, "from_settings") = sweeper;
        manager
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Typed lookup. Undecodable payloads count as misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }

        let decoded = match self.store.get(key).await {
            Some(raw) => match serde_json::from_slice::<T>(&raw) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(source = SOURCE, key, error = %err, "cached payload could not be decoded");
                    None
                }
            },
            None => None,
        };

        if decoded.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_HIT_TOTAL, "store" => self.store.name()).increment(1);
            debug!(source = SOURCE, key, outcome = "hit", "cache lookup");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_MISS_TOTAL, "store" => self.store.name()).increment(1);
            debug!(source = SOURCE, key, outcome = "miss", "cache lookup");
        }

        decoded
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        if !self.enabled {
            return false;
        }

        let encoded = match serde_json::to_vec(value) {
            Ok(encoded) => Bytes::from(encoded),
            Err(err) => {
                warn!(source = SOURCE, key, error = %err, "value could not be encoded for caching");
                return false;
            }
        };

        self.store.set(key, encoded, ttl).await
    }

    /// Cache-aside: return the stored value for `key`, or run `producer`,
    /// store its success and return it. Producer errors are returned as-is
    /// and never stored.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        key: &str,
        producer: F,
        ttl: Duration,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.enabled {
            return producer().await;
        }

        if let Some(cached) = self.get::<T>(key).await {
            return Ok(cached);
        }

        let value = producer().await?;
        if !self.set(key, &value, ttl).await {
            debug!(source = SOURCE, key, "computed value was not stored");
        }

        Ok(value)
    }

    /// Delete every live key matching `pattern`, returning how many were
    /// removed.
    pub async fn delete(&self, pattern: &str) -> u64 {
        let compiled = self.compile(pattern);

        let removed = if compiled.is_exact() {
            self.store.delete(pattern).await
        } else {
            let mut removed = 0;
            for key in self.store.keys(Some(&compiled)).await {
                removed += self.store.delete(&key).await;
            }
            removed
        };

        if removed > 0 {
            counter!(METRIC_INVALIDATED_TOTAL, "store" => self.store.name()).increment(removed);
        }
        debug!(source = SOURCE, pattern, removed, "pattern delete");

        removed
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            key_count: self.store.keys(None).await.len() as u64,
        }
    }

    /// Flush the store and zero the counters.
    pub async fn reset(&self) {
        self.store.flush().await;
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        info!(source = SOURCE, store = self.store.name(), "cache reset");
    }

    pub async fn is_ready(&self) -> bool {
        self.store.is_ready().await
    }

    /// Stop background maintenance and close the store. Idempotent.
    pub async fn close(&self) {
        if let Some(sweeper) = lock_or_recover(&self.sweeper, SOURCE, "close").take() {
            sweeper.abort();
        }
        self.store.close().await;
    }

    fn compile(&self, pattern: &str) -> KeyPattern {
        if let Some(compiled) = self.patterns.get(pattern) {
            return compiled.clone();
        }

        let compiled = KeyPattern::new(pattern);
        if self.patterns.len() < PATTERN_MEMO_LIMIT {
            self.patterns.insert(pattern.to_string(), compiled.clone());
        }
        compiled
    }
}

async fn connect_redis(settings: &Settings) -> Option<RedisStore> {
    let Some(url) = settings.redis.url.as_deref() else {
        warn!(source = SOURCE, "no redis url configured");
        return None;
    };

    match RedisStore::connect(
        url,
        settings.redis.namespace.clone(),
        settings.redis.connect_timeout,
    )
    .await
    {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(source = SOURCE, error = %err, "failed to connect to shared store");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde::Deserialize;

    use super::*;
    use crate::config::CacheSettings;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        codigo: u64,
        descricao: String,
    }

    fn manager() -> CacheManager {
        CacheManager::new(Arc::new(MemoryStore::default()))
    }

    fn item() -> Item {
        Item {
            codigo: 7530110,
            descricao: "Parafuso".to_string(),
        }
    }

    #[tokio::test]
    async fn one_miss_then_one_hit_is_half_hit_rate() {
        let cache = manager();
        assert_eq!(cache.stats().await.hit_rate(), 0.0);

        assert!(cache.get::<Item>("item:1").await.is_none());
        cache.set("item:1", &item(), Duration::from_secs(60)).await;
        assert_eq!(cache.get::<Item>("item:1").await, Some(item()));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.key_count, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn get_or_set_runs_producer_only_on_miss() {
        let cache = manager();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_set(
                    "item:1",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(item())
                    },
                    Duration::from_secs(60),
                )
                .await
                .expect("producer succeeds");
            assert_eq!(value, item());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn producer_error_propagates_and_is_not_stored() {
        let cache = manager();

        let result = cache
            .get_or_set(
                "item:1",
                || async { Err::<Item, _>("database unavailable") },
                Duration::from_secs(60),
            )
            .await;
        assert_eq!(result, Err("database unavailable"));
        assert!(cache.store().keys(None).await.is_empty());

        let recovered = cache
            .get_or_set(
                "item:1",
                || async { Ok::<_, &str>(item()) },
                Duration::from_secs(60),
            )
            .await;
        assert_eq!(recovered, Ok(item()));
    }

    #[tokio::test]
    async fn undecodable_payload_counts_as_miss() {
        let cache = manager();
        cache
            .store()
            .set("item:1", Bytes::from_static(b"not json"), Duration::from_secs(60))
            .await;

        assert!(cache.get::<Item>("item:1").await.is_none());
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn delete_resolves_patterns_and_counts_removals() {
        let cache = manager();
        let ttl = Duration::from_secs(60);
        for key in ["item:1", "item:2", "estabelecimento:1"] {
            cache.set(key, &1_u32, ttl).await;
        }

        assert_eq!(cache.delete("item:*").await, 2);
        assert_eq!(cache.delete("item:*").await, 0);
        assert_eq!(cache.delete("estabelecimento:1").await, 1);
        assert_eq!(cache.delete("nothing:*").await, 0);
    }

    #[tokio::test]
    async fn reset_flushes_and_zeroes_counters() {
        let cache = manager();
        cache.set("k", &1_u32, Duration::from_secs(60)).await;
        let _ = cache.get::<u32>("k").await;
        let _ = cache.get::<u32>("missing").await;

        cache.reset().await;

        assert_eq!(cache.stats().await, CacheStats::default());
    }

    #[tokio::test]
    async fn disabled_manager_always_recomputes() {
        let cache = CacheManager::disabled();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_set(
                    "k",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(1_u32)
                    },
                    Duration::from_secs(60),
                )
                .await
                .expect("producer succeeds");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.set("k", &1_u32, Duration::from_secs(60)).await);
        assert_eq!(cache.stats().await, CacheStats::default());
    }

    #[tokio::test]
    async fn closed_manager_degrades_to_recompute() {
        let cache = manager();
        cache.close().await;
        cache.close().await;

        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            cache
                .get_or_set(
                    "k",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(1_u32)
                    },
                    Duration::from_secs(60),
                )
                .await
                .expect("producer succeeds");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.is_ready().await);
    }

    #[tokio::test]
    async fn from_settings_honours_disabled_flag() {
        let settings = Settings {
            cache: CacheSettings {
                enabled: false,
                ..CacheSettings::default()
            },
            ..Settings::default()
        };

        let cache = CacheManager::from_settings(&settings).await;
        assert!(!cache.is_enabled());
    }

    #[tokio::test]
    async fn unreachable_shared_store_degrades_tiered_to_memory() {
        let mut settings = Settings {
            cache: CacheSettings {
                backend: BackendKind::Tiered,
                ..CacheSettings::default()
            },
            ..Settings::default()
        };
        settings.redis.url = Some("redis://127.0.0.1:1/".to_string());
        settings.redis.connect_timeout = Duration::from_millis(200);

        let cache = CacheManager::from_settings(&settings).await;
        assert_eq!(cache.store().name(), "memory");
        assert!(cache.set("k", &1_u32, Duration::from_secs(60)).await);
        cache.close().await;
    }

    #[tokio::test]
    async fn unreachable_shared_store_degrades_redis_to_noop() {
        let mut settings = Settings {
            cache: CacheSettings {
                backend: BackendKind::Redis,
                ..CacheSettings::default()
            },
            ..Settings::default()
        };
        settings.redis.url = Some("redis://127.0.0.1:1/".to_string());
        settings.redis.connect_timeout = Duration::from_millis(200);

        let cache = CacheManager::from_settings(&settings).await;
        assert_eq!(cache.store().name(), "noop");
        assert!(cache.is_enabled());
    }
}
