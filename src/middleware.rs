//! Response cache middleware for axum routers.
//!
//! [`response_cache_layer`] serves safe requests from the cache and captures
//! successful responses on a miss. [`invalidate_on_success`] sits on mutating
//! routes and drops matching keys once the handler answered with a 2xx.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::BodyExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::form_urlencoded;

use crate::config::ResponseSettings;
use crate::manager::CacheManager;
use crate::telemetry::{METRIC_RESPONSE_HIT_TOTAL, METRIC_RESPONSE_MISS_TOTAL};

pub const X_CACHE: &str = "x-cache";
pub const X_CACHE_KEY: &str = "x-cache-key";

const EVENT_STREAM: &str = "text/event-stream";

/// A captured response as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "base64_body")]
    pub body: Bytes,
}

mod base64_body {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Derives the cache key for a request; `None` bypasses the cache.
pub type KeyFn = Arc<dyn Fn(&Request<Body>) -> Option<String> + Send + Sync>;

/// Decides whether a handler response is stored.
pub type CacheCondition = Arc<dyn Fn(StatusCode, &HeaderMap) -> bool + Send + Sync>;

/// Shared state for [`response_cache_layer`].
#[derive(Clone)]
pub struct ResponseCacheState {
    manager: Arc<CacheManager>,
    ttl: Duration,
    key_prefix: Arc<str>,
    max_body_bytes: u64,
    allowed_headers: Arc<[HeaderName]>,
    key_fn: Option<KeyFn>,
    condition: CacheCondition,
}

impl ResponseCacheState {
    pub fn new(manager: Arc<CacheManager>, settings: &ResponseSettings) -> Self {
        Self {
            manager,
            ttl: settings.ttl,
            key_prefix: Arc::from(settings.key_prefix.as_str()),
            max_body_bytes: settings.max_body_bytes.get() as u64,
            allowed_headers: Arc::from(vec![
                header::CONTENT_TYPE,
                header::CONTENT_ENCODING,
                settings.correlation_header.clone(),
            ]),
            key_fn: None,
            condition: Arc::new(|status, _| status == StatusCode::OK),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Request<Body>) -> Option<String> + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(StatusCode, &HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.condition = Arc::new(condition);
        self
    }

    fn key_for(&self, request: &Request<Body>) -> Option<String> {
        match &self.key_fn {
            Some(key_fn) => key_fn(request),
            None => Some(default_key(&self.key_prefix, request.method(), request.uri())),
        }
    }

    fn should_capture(&self, response: &Response) -> bool {
        if !(self.condition)(response.status(), response.headers()) {
            return false;
        }
        if is_event_stream(response.headers()) {
            return false;
        }

        // Bodies of unknown length are streamed through untouched.
        response
            .body()
            .size_hint()
            .upper()
            .is_some_and(|upper| upper <= self.max_body_bytes)
    }

    fn capture(&self, status: StatusCode, headers: &HeaderMap, body: Bytes) -> CachedResponse {
        let headers = self
            .allowed_headers
            .iter()
            .flat_map(|name| {
                headers.get_all(name).into_iter().filter_map(move |value| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
            })
            .collect();

        CachedResponse {
            status: status.as_u16(),
            headers,
            body,
        }
    }
}

/// `prefix:METHOD:path[?query]` with query parameters stably sorted by name.
pub fn default_key(prefix: &str, method: &Method, uri: &Uri) -> String {
    let mut key = format!("{prefix}:{method}:{}", uri.path());

    if let Some(query) = uri.query().filter(|query| !query.is_empty()) {
        let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let sorted = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        key.push('?');
        key.push_str(&sorted);
    }

    key
}

/// Serve safe requests from the cache and store cacheable responses.
///
/// Every response that went through a lookup carries `X-Cache: HIT|MISS`
/// and `X-Cache-Key`. Stores happen on a detached task so a slow backend
/// never delays the response.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<ResponseCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !cache.manager.is_enabled() {
        return next.run(request).await;
    }

    if *request.method() != Method::GET && *request.method() != Method::HEAD {
        return next.run(request).await;
    }

    let Some(key) = cache.key_for(&request) else {
        return next.run(request).await;
    };

    if let Some(cached) = cache.manager.get::<CachedResponse>(&key).await {
        counter!(METRIC_RESPONSE_HIT_TOTAL).increment(1);
        debug!(cache = "response", outcome = "hit", key = %key, "serving cached response");
        return mark(replay(cached), "HIT", &key);
    }

    counter!(METRIC_RESPONSE_MISS_TOTAL).increment(1);
    debug!(cache = "response", outcome = "miss", key = %key, "cache miss, executing handler");

    let response = next.run(request).await;
    if !cache.should_capture(&response) {
        return mark(response, "MISS", &key);
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(cache = "response", key = %key, error = %err, "failed to buffer response body");
            // the body is gone; keep the handler's status and headers
            parts.headers.remove(header::CONTENT_LENGTH);
            return mark(Response::from_parts(parts, Body::empty()), "MISS", &key);
        }
    };

    let cached = cache.capture(parts.status, &parts.headers, bytes.clone());
    let manager = Arc::clone(&cache.manager);
    let ttl = cache.ttl;
    let store_key = key.clone();
    tokio::spawn(async move {
        if manager.set(&store_key, &cached, ttl).await {
            debug!(cache = "response", key = %store_key, "stored response");
        } else {
            warn!(cache = "response", key = %store_key, "response was not stored");
        }
    });

    mark(Response::from_parts(parts, Body::from(bytes)), "MISS", &key)
}

fn replay(cached: CachedResponse) -> Response {
    let mut builder = Response::builder().status(cached.status);

    for (name, value) in cached.headers {
        if let Ok(value) = HeaderValue::from_str(&value) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from(cached.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn mark(mut response: Response, outcome: &'static str, key: &str) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(X_CACHE),
        HeaderValue::from_static(outcome),
    );
    if let Ok(value) = HeaderValue::from_str(key) {
        headers.insert(HeaderName::from_static(X_CACHE_KEY), value);
    }
    response
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with(EVENT_STREAM))
}

/// Computes invalidation patterns from the request.
pub type PatternFn = Arc<dyn Fn(&Method, &Uri) -> Vec<String> + Send + Sync>;

#[derive(Clone)]
pub enum InvalidationPatterns {
    Static(Arc<[String]>),
    Computed(PatternFn),
}

impl InvalidationPatterns {
    fn resolve(&self, method: &Method, uri: &Uri) -> Vec<String> {
        match self {
            Self::Static(patterns) => patterns.to_vec(),
            Self::Computed(compute) => compute(method, uri),
        }
    }
}

/// Shared state for [`invalidate_on_success`].
#[derive(Clone)]
pub struct InvalidationState {
    manager: Arc<CacheManager>,
    patterns: InvalidationPatterns,
}

impl InvalidationState {
    pub fn new<I, S>(manager: Arc<CacheManager>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            manager,
            patterns: InvalidationPatterns::Static(patterns.into_iter().map(Into::into).collect()),
        }
    }

    pub fn computed<F>(manager: Arc<CacheManager>, compute: F) -> Self
    where
        F: Fn(&Method, &Uri) -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            manager,
            patterns: InvalidationPatterns::Computed(Arc::new(compute)),
        }
    }
}

/// Drop matching cache keys after a mutating handler succeeds.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn invalidate_on_success(
    State(state): State<InvalidationState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;
    if !response.status().is_success() {
        return response;
    }

    let patterns = state.patterns.resolve(&method, &uri);
    let mut removed = 0;
    for pattern in &patterns {
        removed += state.manager.delete(pattern).await;
    }

    info!(
        cache = "response",
        patterns = patterns.len(),
        removed,
        "invalidated after successful write"
    );

    response
}
