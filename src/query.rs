//! Deterministic caching of data-access results.
//!
//! Keys are derived from the query text and its parameters so callers never
//! build them by hand:
//!
//! ```text
//! prefix ":" hex(sha256(normalized_query ":" canonical_params_json))[..16]
//! ```
//!
//! Whitespace differences in the query text and ordering differences in the
//! parameters map to the same key.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::CacheSettings;
use crate::manager::CacheManager;

pub const DEFAULT_PREFIX: &str = "query";
pub const ITEM_PREFIX: &str = "item";
pub const ESTABELECIMENTO_PREFIX: &str = "estabelecimento";
pub const HEALTH_PREFIX: &str = "health";

const HASH_LEN: usize = 16;

/// One bound parameter of a query.
///
/// Only `name` and `value` take part in key derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParam {
    pub name: Option<String>,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,
}

impl QueryParam {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: Some(name.into()),
            value: value.into(),
            type_hint: None,
        }
    }

    pub fn unnamed(value: impl Into<Value>) -> Self {
        Self {
            name: None,
            value: value.into(),
            type_hint: None,
        }
    }

    pub fn with_type_hint(mut self, hint: impl Into<String>) -> Self {
        self.type_hint = Some(hint.into());
        self
    }
}

/// Parameters bound to a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum QueryParams {
    #[default]
    None,
    /// A sequence of `{name, value}` pairs; order does not affect the key.
    Pairs(Vec<QueryParam>),
    /// A keyed structure; key order does not affect the key at any depth.
    Keyed(Value),
}

impl From<Vec<QueryParam>> for QueryParams {
    fn from(params: Vec<QueryParam>) -> Self {
        Self::Pairs(params)
    }
}

impl From<Map<String, Value>> for QueryParams {
    fn from(map: Map<String, Value>) -> Self {
        Self::Keyed(Value::Object(map))
    }
}

impl From<Value> for QueryParams {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::None,
            other => Self::Keyed(other),
        }
    }
}

#[derive(Serialize)]
struct CanonicalParam<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    value: Value,
}

impl QueryParams {
    fn canonical_json(&self) -> String {
        let canonical = match self {
            Self::None => Value::Null,
            Self::Pairs(params) => {
                let mut projected: Vec<CanonicalParam<'_>> = params
                    .iter()
                    .map(|param| CanonicalParam {
                        name: param.name.as_deref(),
                        value: sort_keys(&param.value),
                    })
                    .collect();
                projected.sort_by(|a, b| a.name.unwrap_or("").cmp(b.name.unwrap_or("")));
                serde_json::to_value(projected).unwrap_or(Value::Null)
            }
            Self::Keyed(value) => sort_keys(value),
        };

        canonical.to_string()
    }
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), sort_keys(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Collapse whitespace runs to a single space and trim.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cache key for `query` bound to `params` under `prefix`.
pub fn derive_key(prefix: &str, query: &str, params: &QueryParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    hasher.update(b":");
    hasher.update(params.canonical_json().as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{prefix}:{}", &digest[..HASH_LEN])
}

/// Per-call overrides for [`QueryCache::with_cache`].
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    pub ttl: Option<Duration>,
    pub prefix: Option<String>,
    /// Call the producer without reading or writing the cache.
    pub skip_cache: bool,
}

impl CacheOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn skip_cache(mut self, skip: bool) -> Self {
        self.skip_cache = skip;
        self
    }
}

/// Query result cache bound to a [`CacheManager`].
#[derive(Clone)]
pub struct QueryCache {
    manager: Arc<CacheManager>,
    default_ttl: Duration,
    item_ttl: Duration,
    estabelecimento_ttl: Duration,
    health_ttl: Duration,
}

impl QueryCache {
    pub fn new(manager: Arc<CacheManager>, settings: &CacheSettings) -> Self {
        Self {
            manager,
            default_ttl: settings.default_ttl,
            item_ttl: settings.item_ttl,
            estabelecimento_ttl: settings.estabelecimento_ttl,
            health_ttl: settings.health_ttl,
        }
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub async fn with_cache<T, E, F, Fut>(
        &self,
        query: &str,
        params: &QueryParams,
        producer: F,
        options: CacheOptions,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if options.skip_cache {
            debug!(source = "query", "cache bypassed for this call");
            return producer().await;
        }

        let prefix = options.prefix.as_deref().unwrap_or(DEFAULT_PREFIX);
        let key = derive_key(prefix, query, params);
        let ttl = options.ttl.unwrap_or(self.default_ttl);

        self.manager.get_or_set(&key, producer, ttl).await
    }

    pub async fn with_item_cache<T, E, F, Fut>(
        &self,
        query: &str,
        params: &QueryParams,
        producer: F,
        ttl: Option<Duration>,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = CacheOptions::default()
            .prefix(ITEM_PREFIX)
            .ttl(ttl.unwrap_or(self.item_ttl));
        self.with_cache(query, params, producer, options).await
    }

    pub async fn with_estabelecimento_cache<T, E, F, Fut>(
        &self,
        query: &str,
        params: &QueryParams,
        producer: F,
        ttl: Option<Duration>,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = CacheOptions::default()
            .prefix(ESTABELECIMENTO_PREFIX)
            .ttl(ttl.unwrap_or(self.estabelecimento_ttl));
        self.with_cache(query, params, producer, options).await
    }

    pub async fn with_health_cache<T, E, F, Fut>(
        &self,
        query: &str,
        params: &QueryParams,
        producer: F,
        ttl: Option<Duration>,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = CacheOptions::default()
            .prefix(HEALTH_PREFIX)
            .ttl(ttl.unwrap_or(self.health_ttl));
        self.with_cache(query, params, producer, options).await
    }

    pub async fn invalidate(&self, pattern: &str) -> u64 {
        let removed = self.manager.delete(pattern).await;
        info!(source = "query", pattern, removed, "invalidated cached queries");
        removed
    }

    pub async fn invalidate_multiple<I, S>(&self, patterns: I) -> u64
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = 0;
        for pattern in patterns {
            removed += self.invalidate(pattern.as_ref()).await;
        }
        removed
    }

    pub async fn invalidate_items(&self) -> u64 {
        self.invalidate(&format!("{ITEM_PREFIX}:*")).await
    }

    pub async fn invalidate_estabelecimentos(&self) -> u64 {
        self.invalidate(&format!("{ESTABELECIMENTO_PREFIX}:*")).await
    }

    pub async fn invalidate_health(&self) -> u64 {
        self.invalidate(&format!("{HEALTH_PREFIX}:*")).await
    }

    /// Drop every key under the query, item, estabelecimento and health
    /// prefixes. Response cache keys are left alone.
    pub async fn invalidate_all(&self) -> u64 {
        self.invalidate_multiple(
            [DEFAULT_PREFIX, ITEM_PREFIX, ESTABELECIMENTO_PREFIX, HEALTH_PREFIX]
                .iter()
                .map(|prefix| format!("{prefix}:*")),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    fn cache() -> QueryCache {
        let manager = Arc::new(CacheManager::new(Arc::new(MemoryStore::default())));
        QueryCache::new(manager, &CacheSettings::default())
    }

    #[test]
    fn whitespace_does_not_change_the_key() {
        let params = QueryParams::None;
        assert_eq!(
            derive_key("query", "SELECT *\n  FROM item\tWHERE codigo = $1 ", &params),
            derive_key("query", "SELECT * FROM item WHERE codigo = $1", &params),
        );
    }

    #[test]
    fn pair_order_and_type_hints_do_not_change_the_key() {
        let a = QueryParams::from(vec![
            QueryParam::new("codigo", 7530110),
            QueryParam::new("ativo", true).with_type_hint("bit"),
        ]);
        let b = QueryParams::from(vec![
            QueryParam::new("ativo", true),
            QueryParam::new("codigo", 7530110).with_type_hint("int"),
        ]);

        assert_eq!(derive_key("item", "q", &a), derive_key("item", "q", &b));
    }

    #[test]
    fn keyed_params_are_sorted_at_every_depth() {
        let a = QueryParams::from(json!({"b": 1, "a": {"y": 2, "x": 3}}));
        let b = QueryParams::from(json!({"a": {"x": 3, "y": 2}, "b": 1}));

        assert_eq!(derive_key("query", "q", &a), derive_key("query", "q", &b));
    }

    #[test]
    fn different_values_produce_different_keys() {
        let a = QueryParams::from(vec![QueryParam::new("codigo", 1)]);
        let b = QueryParams::from(vec![QueryParam::new("codigo", 2)]);

        assert_ne!(derive_key("item", "q", &a), derive_key("item", "q", &b));
        assert_ne!(
            derive_key("item", "q", &QueryParams::None),
            derive_key("item", "q", &QueryParams::Pairs(Vec::new()))
        );
    }

    #[test]
    fn key_is_prefix_and_short_hash() {
        let key = derive_key("estabelecimento", "SELECT 1", &QueryParams::None);
        let (prefix, hash) = key.split_once(':').expect("prefixed key");

        assert_eq!(prefix, "estabelecimento");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn unnamed_params_sort_first() {
        let params = QueryParams::from(vec![
            QueryParam::new("a", 1),
            QueryParam::unnamed(2),
        ]);
        assert_eq!(params.canonical_json(), r#"[{"value":2},{"name":"a","value":1}]"#);
    }

    #[tokio::test]
    async fn producer_runs_once_for_equivalent_calls() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        let produce = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(vec!["Parafuso".to_string()])
        };

        let first = cache
            .with_item_cache(
                "SELECT descricao FROM item WHERE codigo = @codigo",
                &QueryParams::from(vec![QueryParam::new("codigo", 7530110)]),
                produce,
                None,
            )
            .await;
        let second = cache
            .with_item_cache(
                "SELECT descricao  FROM item WHERE codigo = @codigo",
                &QueryParams::from(vec![QueryParam::new("codigo", 7530110)]),
                produce,
                None,
            )
            .await;

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn preset_ttl_is_honoured() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        let produce = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>("ok".to_string())
        };

        cache
            .with_health_cache("SELECT 1", &QueryParams::None, produce, None)
            .await
            .expect("producer succeeds");
        tokio::time::advance(Duration::from_secs(29)).await;
        cache
            .with_health_cache("SELECT 1", &QueryParams::None, produce, None)
            .await
            .expect("producer succeeds");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        cache
            .with_health_cache("SELECT 1", &QueryParams::None, produce, None)
            .await
            .expect("producer succeeds");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn skip_cache_leaves_stored_value_untouched() {
        let cache = cache();
        let params = QueryParams::None;

        let stored = cache
            .with_cache("q", &params, || async { Ok::<_, String>(1_u32) }, CacheOptions::default())
            .await;
        let bypassed = cache
            .with_cache(
                "q",
                &params,
                || async { Ok::<_, String>(2_u32) },
                CacheOptions::default().skip_cache(true),
            )
            .await;
        let cached = cache
            .with_cache("q", &params, || async { Ok::<_, String>(3_u32) }, CacheOptions::default())
            .await;

        assert_eq!(stored, Ok(1));
        assert_eq!(bypassed, Ok(2));
        assert_eq!(cached, Ok(1));
    }

    #[tokio::test]
    async fn named_invalidation_helpers_target_their_prefix() {
        let cache = cache();
        for (prefix, query) in [
            (ITEM_PREFIX, "a"),
            (ITEM_PREFIX, "b"),
            (ESTABELECIMENTO_PREFIX, "a"),
            (HEALTH_PREFIX, "a"),
            (DEFAULT_PREFIX, "a"),
        ] {
            cache
                .with_cache(
                    query,
                    &QueryParams::None,
                    || async { Ok::<_, String>(0_u8) },
                    CacheOptions::default().prefix(prefix),
                )
                .await
                .expect("producer succeeds");
        }

        assert_eq!(cache.invalidate_items().await, 2);
        assert_eq!(cache.invalidate_items().await, 0);
        assert_eq!(cache.invalidate_health().await, 1);
        assert_eq!(cache.invalidate_all().await, 2);
        assert_eq!(cache.manager().stats().await.key_count, 0);
    }
}
