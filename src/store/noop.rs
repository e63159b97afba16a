use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::CacheStore;
use crate::pattern::KeyPattern;

/// Store that never holds anything.
///
/// Stands in when caching is disabled or the configured shared store could
/// not be reached at startup, so every lookup recomputes.
#[derive(Debug, Default)]
pub struct NoopStore {
    closed: AtomicBool,
}

impl NoopStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for NoopStore {
    async fn get(&self, _key: &str) -> Option<Bytes> {
        None
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> bool {
        false
    }

    async fn delete(&self, _key: &str) -> u64 {
        0
    }

    async fn flush(&self) {}

    async fn keys(&self, _pattern: Option<&KeyPattern>) -> Vec<String> {
        Vec::new()
    }

    async fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
