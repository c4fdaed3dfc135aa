use std::borrow::Cow;

use opentelemetry::global;
use opentelemetry_sdk::{Resource, error::OTelSdkError, metrics::MeterProviderBuilder};
use snafu::{ResultExt, Snafu};
use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, Layer, prelude::*, registry::LookupSpan, util::TryInitError};

pub use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};

pub use crate::metrics::MetricsExporter;

mod metrics;

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ObservabilityError {
    #[snafu(display("Failed to install the tracing subscriber"))]
    Subscriber { source: TryInitError },
    #[snafu(display("Failed to collect metrics"))]
    Collect { source: OTelSdkError },
}

pub fn meter(name: &'static str) -> Meter {
    global::meter(name)
}

/// Installs the log subscriber and a meter provider reading into `metrics_exporter`.
///
/// Logs go to stderr, filtered by `RUST_LOG` (default `info`). Set
/// `RUST_LOG_FORMAT=json` for JSON logs.
pub fn init_observability(
    package_name: impl Into<Cow<'static, str>>,
    metrics_exporter: MetricsExporter,
) -> Result<(), ObservabilityError> {
    let resource = Resource::builder()
        .with_service_name(package_name.into().into_owned())
        .build();

    let meter_provider = MeterProviderBuilder::default()
        .with_resource(resource)
        .with_reader(metrics_exporter)
        .build();

    global::set_meter_provider(meter_provider);

    tracing_subscriber::registry()
        .with(stderr())
        .try_init()
        .context(SubscriberSnafu {})
}

fn stderr<S>() -> BoxedLayer<S>
where
    S: Subscriber,
    for<'a> S: LookupSpan<'a>,
{
    let log_env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("INFO"));

    let json_fmt = std::env::var("RUST_LOG_FORMAT")
        .map(|val| val == "json")
        .unwrap_or(false);

    // Stdout is left to the application.
    if json_fmt {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(true)
            .json()
            .with_filter(log_env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .with_filter(log_env_filter)
            .boxed()
    }
}
