use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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
            "geoprint_jobs_total",
            Unit::Count,
            "Total number of print jobs, labelled by result and output format."
        );
        describe_counter!(
            "geoprint_layers_filtered_total",
            Unit::Count,
            "Total number of layers removed from print jobs for unauthorized topics."
        );
        describe_counter!(
            "geoprint_artifacts_purged_total",
            Unit::Count,
            "Total number of expired print artifacts deleted by retention sweeps."
        );
        describe_histogram!(
            "geoprint_render_ms",
            Unit::Milliseconds,
            "Print engine render latency in milliseconds."
        );
        describe_histogram!(
            "geoprint_convert_ms",
            Unit::Milliseconds,
            "PDF to raster conversion latency in milliseconds."
        );
    });
}
