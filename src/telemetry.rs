use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing::Subscriber;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::TelemetryError;

pub const METRIC_HIT_TOTAL: &str = "tiercache_hit_total";
pub const METRIC_MISS_TOTAL: &str = "tiercache_miss_total";
pub const METRIC_STORE_EVICT_TOTAL: &str = "tiercache_store_evict_total";
pub const METRIC_RESPONSE_HIT_TOTAL: &str = "tiercache_response_hit_total";
pub const METRIC_RESPONSE_MISS_TOTAL: &str = "tiercache_response_miss_total";
pub const METRIC_INVALIDATED_TOTAL: &str = "tiercache_invalidated_keys_total";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global subscriber for cache logging.
///
/// `RUST_LOG` directives win over `logging.level`. Fails if the host already
/// installed a subscriber.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    tracing_subscriber::registry()
        .with(level_filter(logging))
        .with(ErrorLayer::default())
        .with(output_layer(logging.format))
        .try_init()
        .map_err(|err| TelemetryError::Subscriber(err.to_string()))
}

fn level_filter(logging: &LoggingSettings) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy()
}

fn output_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    match format {
        // flat objects so event fields sit next to the message
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    }
}

/// Register descriptions for every metric the crate emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_HIT_TOTAL,
            Unit::Count,
            "Cache manager lookups served from the store."
        );
        describe_counter!(
            METRIC_MISS_TOTAL,
            Unit::Count,
            "Cache manager lookups that found nothing usable."
        );
        describe_counter!(
            METRIC_STORE_EVICT_TOTAL,
            Unit::Count,
            "In-process store evictions due to capacity."
        );
        describe_counter!(
            METRIC_RESPONSE_HIT_TOTAL,
            Unit::Count,
            "HTTP responses replayed from the response cache."
        );
        describe_counter!(
            METRIC_RESPONSE_MISS_TOTAL,
            Unit::Count,
            "Cacheable HTTP requests that reached the handler."
        );
        describe_counter!(
            METRIC_INVALIDATED_TOTAL,
            Unit::Count,
            "Keys removed by pattern invalidation."
        );
    });
}
