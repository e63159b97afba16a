//! Multi-tier caching for query results and HTTP responses.
//!
//! - [`store`]: the [`CacheStore`] contract and its backends (in-process,
//!   Redis, tiered, no-op)
//! - [`manager`]: [`CacheManager`], the cache-aside orchestrator
//! - [`query`]: [`QueryCache`], deterministic query keys and domain presets
//! - [`middleware`]: axum response caching and post-write invalidation

pub mod config;
pub mod error;
mod lock;
pub mod manager;
pub mod middleware;
pub mod pattern;
pub mod query;
pub mod store;
pub mod telemetry;

pub use error::{CacheError, CacheResult};
pub use manager::{CacheManager, CacheStats};
pub use middleware::{
    CachedResponse, InvalidationState, ResponseCacheState, invalidate_on_success,
    response_cache_layer,
};
pub use pattern::KeyPattern;
pub use query::{CacheOptions, QueryCache, QueryParam, QueryParams};
pub use store::{CacheStore, MemoryStore, NoopStore, RedisStore, TieredStore};
