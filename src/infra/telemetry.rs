use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "waves_render_engine_launch_total",
            Unit::Count,
            "Total number of successful rendering-engine launches."
        );
        describe_counter!(
            "waves_render_engine_launch_failed_total",
            Unit::Count,
            "Total number of failed rendering-engine launches."
        );
        describe_counter!(
            "waves_render_engine_restart_total",
            Unit::Count,
            "Total number of rendering-engine restarts, labelled by reason."
        );
        describe_counter!(
            "waves_render_engine_restart_deferred_total",
            Unit::Count,
            "Total number of due restarts deferred because sessions were open."
        );
        describe_counter!(
            "waves_render_housekeeping_failure_total",
            Unit::Count,
            "Total number of swallowed failures while closing engines or surfaces."
        );
        describe_gauge!(
            "waves_render_open_sessions",
            Unit::Count,
            "Current number of leased render sessions."
        );
        describe_counter!(
            "waves_render_request_total",
            Unit::Count,
            "Total number of render requests, labelled by outcome."
        );
        describe_histogram!(
            "waves_render_ms",
            Unit::Milliseconds,
            "End-to-end render latency in milliseconds."
        );
    });
}

