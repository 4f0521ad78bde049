use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_CACHE_FILL_FAIL_TOTAL, METRIC_CACHE_FILL_MS, METRIC_CACHE_HIT_TOTAL,
    METRIC_CACHE_MISS_TOTAL,
};
use crate::config::{LogFormat, LoggingSettings};
use crate::deploy::{METRIC_DEPLOY_FAIL_TOTAL, METRIC_DEPLOY_RUN_TOTAL};
use crate::fetch::METRIC_ORIGIN_RETRY_TOTAL;

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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT_TOTAL,
            Unit::Count,
            "Total number of resolves served from an already-present entry."
        );
        describe_counter!(
            METRIC_CACHE_MISS_TOTAL,
            Unit::Count,
            "Total number of cache fills completed."
        );
        describe_counter!(
            METRIC_CACHE_FILL_FAIL_TOTAL,
            Unit::Count,
            "Total number of cache fills that failed."
        );
        describe_histogram!(
            METRIC_CACHE_FILL_MS,
            Unit::Milliseconds,
            "Cache fill latency (fetch plus store) in milliseconds."
        );
        describe_counter!(
            METRIC_ORIGIN_RETRY_TOTAL,
            Unit::Count,
            "Total number of origin fetch attempts that were retried."
        );
        describe_counter!(
            METRIC_DEPLOY_RUN_TOTAL,
            Unit::Count,
            "Total number of deploy runs executed."
        );
        describe_counter!(
            METRIC_DEPLOY_FAIL_TOTAL,
            Unit::Count,
            "Total number of deploy runs that failed."
        );
    });
}
