use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::CacheStore;
use crate::lock::lock_or_recover;
use crate::pattern::KeyPattern;
use crate::telemetry::METRIC_STORE_EVICT_TOTAL;

const STORE: &str = "memory";

pub(crate) const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Clone)]
struct CacheEntry {
    value: Bytes,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process store with per-entry expiry and LRU eviction.
///
/// Expired entries are dropped lazily on `get`; [`MemoryStore::spawn_sweeper`]
/// adds a periodic sweep on top.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, CacheEntry>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new(max_entries: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(max_entries)),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of stored entries, expired ones included until they are swept.
    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries, STORE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = lock_or_recover(&self.entries, STORE, "purge_expired");

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }

        expired.len()
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until the
    /// store is closed or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                if store.is_closed() {
                    break;
                }

                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(store = STORE, purged, "swept expired entries");
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<Bytes> {
        if self.is_closed() {
            debug!(store = STORE, op = "get", key, "store closed, treating as miss");
            return None;
        }

        let now = Instant::now();
        let mut entries = lock_or_recover(&self.entries, STORE, "get");

        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }

        entries.pop(key);
        None
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> bool {
        if self.is_closed() {
            debug!(store = STORE, op = "set", key, "store closed, skipping write");
            return false;
        }

        let Some(expires_at) = Instant::now().checked_add(ttl) else {
            warn!(
                store = STORE,
                op = "set",
                key,
                ttl_secs = ttl.as_secs(),
                "ttl overflows the clock, skipping write"
            );
            return false;
        };
        let entry = CacheEntry { value, expires_at };

        let displaced = lock_or_recover(&self.entries, STORE, "set").push(key.to_string(), entry);

        if let Some((evicted, _)) = displaced {
            if evicted != key {
                debug!(store = STORE, key = %evicted, "evicted least recently used entry");
                counter!(METRIC_STORE_EVICT_TOTAL, "store" => STORE).increment(1);
            }
        }

        true
    }

    async fn delete(&self, key: &str) -> u64 {
        if self.is_closed() {
            return 0;
        }

        let removed = lock_or_recover(&self.entries, STORE, "delete").pop(key);
        u64::from(removed.is_some())
    }

    async fn flush(&self) {
        lock_or_recover(&self.entries, STORE, "flush").clear();
    }

    async fn keys(&self, pattern: Option<&KeyPattern>) -> Vec<String> {
        if self.is_closed() {
            return Vec::new();
        }

        let now = Instant::now();
        lock_or_recover(&self.entries, STORE, "keys")
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .filter(|(key, _)| pattern.is_none_or(|pattern| pattern.matches(key)))
            .map(|(key, _)| key.clone())
            .collect()
    }

    async fn is_ready(&self) -> bool {
        !self.is_closed()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        lock_or_recover(&self.entries, STORE, "close").clear();
        info!(store = STORE, "cache store closed");
    }

    fn name(&self) -> &'static str {
        STORE
    }
}
