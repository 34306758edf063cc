use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names::*;
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text for every cache metric.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_NODE_HIT,
            Unit::Count,
            "Node reads answered from memory."
        );
        describe_counter!(
            METRIC_NODE_MISS,
            Unit::Count,
            "Node reads that found nothing in memory."
        );
        describe_counter!(
            METRIC_NODE_STALE,
            Unit::Count,
            "Node reads that found an entry invalidated by a rebuild."
        );
        describe_counter!(
            METRIC_STALE_SERVED,
            Unit::Count,
            "Stale nodes served because the repository was unavailable."
        );
        describe_histogram!(
            METRIC_REPOSITORY_LOAD_MS,
            Unit::Milliseconds,
            "Read-through repository load latency in milliseconds."
        );
        describe_gauge!(
            METRIC_EVENT_QUEUE_LEN,
            Unit::Count,
            "Current number of pending cache events in the queue."
        );
        describe_counter!(
            METRIC_EVENT_REQUEUED,
            Unit::Count,
            "Cache events put back on the queue after a repository outage."
        );
        describe_histogram!(
            METRIC_CACHE_CONSUME_MS,
            Unit::Milliseconds,
            "Cache consumption latency in milliseconds."
        );
        describe_histogram!(
            METRIC_REBUILD_MS,
            Unit::Milliseconds,
            "Cache rebuild latency in milliseconds."
        );
        describe_counter!(
            METRIC_VERIFY_INCONSISTENT,
            Unit::Count,
            "Verification passes that found a kind inconsistent."
        );
        describe_counter!(
            METRIC_NAVIGATION_REHYDRATE,
            Unit::Count,
            "Navigation trees rebuilt from the repository."
        );
    });
}
