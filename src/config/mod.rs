//! Configuration layer: typed settings with layered precedence
//! (default file → local file → explicit file → environment).

use std::{
    num::NonZeroUsize,
    path::Path,
    str::FromStr,
    time::Duration,
};

use axum::http::HeaderName;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tiercache";
const ENV_PREFIX: &str = "TIERCACHE";

pub const DEFAULT_TTL_SECS: u64 = 300;
pub const DEFAULT_ITEM_TTL_SECS: u64 = 600;
pub const DEFAULT_ESTABELECIMENTO_TTL_SECS: u64 = 900;
pub const DEFAULT_HEALTH_TTL_SECS: u64 = 30;
const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;
const DEFAULT_MAX_ENTRIES: usize = 10_000;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_L1_PROMOTE_TTL_SECS: u64 = 60;
const DEFAULT_REDIS_NAMESPACE: &str = "tiercache:";
const DEFAULT_REDIS_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_RESPONSE_TTL_SECS: u64 = 60;
const DEFAULT_RESPONSE_MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_RESPONSE_KEY_PREFIX: &str = "response";
const DEFAULT_CORRELATION_HEADER: &str = "x-correlation-id";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub redis: RedisSettings,
    pub response: ResponseSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process store only.
    Memory,
    /// Shared Redis store only.
    Redis,
    /// In-process L1 in front of a shared Redis L2.
    Tiered,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "tiered" => Ok(Self::Tiered),
            other => Err(format!(
                "unknown backend `{other}` (expected memory|redis|tiered)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub backend: BackendKind,
    pub default_ttl: Duration,
    pub item_ttl: Duration,
    pub estabelecimento_ttl: Duration,
    pub health_ttl: Duration,
    pub max_entries: NonZeroUsize,
    /// `None` disables the background sweep; expired entries are still
    /// dropped lazily on read.
    pub sweep_interval: Option<Duration>,
    pub l1_promote_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: Option<String>,
    pub namespace: String,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ResponseSettings {
    pub ttl: Duration,
    pub max_body_bytes: NonZeroUsize,
    pub key_prefix: String,
    pub correlation_header: HeaderName,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Compact,
            },
            cache: CacheSettings::default(),
            redis: RedisSettings {
                url: None,
                namespace: DEFAULT_REDIS_NAMESPACE.to_string(),
                connect_timeout: Duration::from_millis(DEFAULT_REDIS_CONNECT_TIMEOUT_MS),
            },
            response: ResponseSettings::default(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Memory,
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            item_ttl: Duration::from_secs(DEFAULT_ITEM_TTL_SECS),
            estabelecimento_ttl: Duration::from_secs(DEFAULT_ESTABELECIMENTO_TTL_SECS),
            health_ttl: Duration::from_secs(DEFAULT_HEALTH_TTL_SECS),
            max_entries: NonZeroUsize::new(DEFAULT_MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN),
            sweep_interval: Some(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS)),
            l1_promote_ttl: Duration::from_secs(DEFAULT_L1_PROMOTE_TTL_SECS),
        }
    }
}

impl Default for ResponseSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_RESPONSE_TTL_SECS),
            max_body_bytes: NonZeroUsize::new(DEFAULT_RESPONSE_MAX_BODY_BYTES)
                .unwrap_or(NonZeroUsize::MIN),
            key_prefix: DEFAULT_RESPONSE_KEY_PREFIX.to_string(),
            correlation_header: HeaderName::from_static(DEFAULT_CORRELATION_HEADER),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence
/// (`config/default` → `tiercache` → `config_file` → `TIERCACHE__*` env).
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    redis: RawRedisSettings,
    response: RawResponseSettings,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            redis,
            response,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let redis = build_redis_settings(redis, cache.backend)?;
        let response = build_response_settings(response)?;

        Ok(Self {
            logging,
            cache,
            redis,
            response,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backend = match cache.backend {
        Some(value) => BackendKind::from_str(&value)
            .map_err(|reason| LoadError::invalid("cache.backend", reason))?,
        None => BackendKind::Memory,
    };

    let default_ttl = ttl(
        cache.default_ttl_seconds,
        DEFAULT_TTL_SECS,
        "cache.default_ttl_seconds",
    )?;
    let item_ttl = ttl(
        cache.item_ttl_seconds,
        DEFAULT_ITEM_TTL_SECS,
        "cache.item_ttl_seconds",
    )?;
    let estabelecimento_ttl = ttl(
        cache.estabelecimento_ttl_seconds,
        DEFAULT_ESTABELECIMENTO_TTL_SECS,
        "cache.estabelecimento_ttl_seconds",
    )?;
    let health_ttl = ttl(
        cache.health_ttl_seconds,
        DEFAULT_HEALTH_TTL_SECS,
        "cache.health_ttl_seconds",
    )?;
    let l1_promote_ttl = ttl(
        cache.l1_promote_ttl_seconds,
        DEFAULT_L1_PROMOTE_TTL_SECS,
        "cache.l1_promote_ttl_seconds",
    )?;

    let max_entries = cache.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES);
    let max_entries = NonZeroUsize::new(max_entries)
        .ok_or_else(|| LoadError::invalid("cache.max_entries", "must be greater than zero"))?;

    let sweep_secs = cache
        .sweep_interval_seconds
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    let sweep_interval = (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs));

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        backend,
        default_ttl,
        item_ttl,
        estabelecimento_ttl,
        health_ttl,
        max_entries,
        sweep_interval,
        l1_promote_ttl,
    })
}

fn build_redis_settings(
    redis: RawRedisSettings,
    backend: BackendKind,
) -> Result<RedisSettings, LoadError> {
    let url = redis.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    if url.is_none() && backend != BackendKind::Memory {
        return Err(LoadError::invalid(
            "redis.url",
            "required when cache.backend is redis or tiered",
        ));
    }

    let connect_timeout_ms = redis
        .connect_timeout_ms
        .unwrap_or(DEFAULT_REDIS_CONNECT_TIMEOUT_MS);
    if connect_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "redis.connect_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(RedisSettings {
        url,
        namespace: redis
            .namespace
            .unwrap_or_else(|| DEFAULT_REDIS_NAMESPACE.to_string()),
        connect_timeout: Duration::from_millis(connect_timeout_ms),
    })
}

fn build_response_settings(response: RawResponseSettings) -> Result<ResponseSettings, LoadError> {
    let ttl = ttl(
        response.ttl_seconds,
        DEFAULT_RESPONSE_TTL_SECS,
        "response.ttl_seconds",
    )?;

    let max_body_bytes = response
        .max_body_bytes
        .unwrap_or(DEFAULT_RESPONSE_MAX_BODY_BYTES);
    let max_body_bytes = NonZeroUsize::new(max_body_bytes).ok_or_else(|| {
        LoadError::invalid("response.max_body_bytes", "must be greater than zero")
    })?;

    let key_prefix = response
        .key_prefix
        .unwrap_or_else(|| DEFAULT_RESPONSE_KEY_PREFIX.to_string());
    if key_prefix.contains('*') {
        return Err(LoadError::invalid(
            "response.key_prefix",
            "must not contain the `*` wildcard",
        ));
    }

    let correlation_header = match response.correlation_header {
        Some(name) => HeaderName::from_str(name.trim()).map_err(|err| {
            LoadError::invalid("response.correlation_header", format!("{err}"))
        })?,
        None => HeaderName::from_static(DEFAULT_CORRELATION_HEADER),
    };

    Ok(ResponseSettings {
        ttl,
        max_body_bytes,
        key_prefix,
        correlation_header,
    })
}

fn ttl(value: Option<u64>, default: u64, key: &'static str) -> Result<Duration, LoadError> {
    let seconds = value.unwrap_or(default);
    if seconds == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    if seconds > MAX_TTL_SECS {
        return Err(LoadError::invalid(
            key,
            format!("must not exceed {MAX_TTL_SECS} seconds"),
        ));
    }
    Ok(Duration::from_secs(seconds))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    backend: Option<String>,
    default_ttl_seconds: Option<u64>,
    item_ttl_seconds: Option<u64>,
    estabelecimento_ttl_seconds: Option<u64>,
    health_ttl_seconds: Option<u64>,
    max_entries: Option<usize>,
    sweep_interval_seconds: Option<u64>,
    l1_promote_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    url: Option<String>,
    namespace: Option<String>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawResponseSettings {
    ttl_seconds: Option<u64>,
    max_body_bytes: Option<usize>,
    key_prefix: Option<String>,
    correlation_header: Option<String>,
}
