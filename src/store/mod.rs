//! Cache store adapters.
//!
//! Every backend implements [`CacheStore`] with the same soft-failure
//! contract: reads that cannot reach the backend return `None`, writes return
//! `false`, deletes return `0`. Callers above this layer never see a backend
//! error.
//!
//! ```text
//! CacheStore (trait)
//!   ├── MemoryStore   <- in-process LRU map with per-entry expiry
//!   ├── RedisStore    <- shared store behind a ConnectionManager
//!   ├── TieredStore   <- L1 checked first, populated on L2 hit
//!   └── NoopStore     <- always miss; disabled or unreachable backends
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::pattern::KeyPattern;

mod memory;
mod noop;
mod redis;
mod tiered;

pub use memory::MemoryStore;
pub use noop::NoopStore;
pub use redis::RedisStore;
pub use tiered::TieredStore;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Stored bytes for `key`, or `None` when unset, expired or unreachable.
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Store `value` until `ttl` elapses, replacing any previous value.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> bool;

    /// Remove `key`, returning how many entries were removed.
    async fn delete(&self, key: &str) -> u64;

    /// Remove every entry owned by this store.
    async fn flush(&self);

    /// Live keys matching `pattern`, or all live keys.
    async fn keys(&self, pattern: Option<&KeyPattern>) -> Vec<String>;

    async fn is_ready(&self) -> bool;

    /// Release backend resources. Safe to call more than once.
    async fn close(&self);

    fn name(&self) -> &'static str;
}
