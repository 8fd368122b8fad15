//! Tracing and metrics setup shared by the backfill binaries.
//!
//! Logs always go to stdout. Traces and metrics are exported over OTLP only
//! when `OTEL_SDK_DISABLED=false`.

use std::borrow::Cow;
use std::time::Duration;

use error_stack::{Result, ResultExt};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, InstrumentationScope};
use opentelemetry_otlp::{MetricExporter, SpanExporter};
use opentelemetry_sdk::metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::resource::{ResourceDetector, SdkProvidedResourceDetector};
use opentelemetry_sdk::trace::TracerProvider;
use tracing::Subscriber;
use tracing_opentelemetry::MetricsLayer;
use tracing_subscriber::{prelude::*, registry::LookupSpan, EnvFilter, Layer};

pub use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
pub use opentelemetry::KeyValue;

const OTEL_SDK_DISABLED: &str = "OTEL_SDK_DISABLED";
const RUST_LOG: &str = "RUST_LOG";
const RUST_LOG_FORMAT: &str = "RUST_LOG_FORMAT";
const METRICS_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Used when `RUST_LOG` is not set. The http stack is noisy at info.
const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,reqwest=warn,warp=warn";

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

#[derive(Debug)]
pub struct ObservabilityInitError;

impl error_stack::Context for ObservabilityInitError {}

impl std::fmt::Display for ObservabilityInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("failed to initialize tracing and metrics")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    /// One json object per line, for log collectors.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityOptions {
    pub log_format: LogFormat,
    /// `EnvFilter` directives for both logs and exported spans.
    pub directives: String,
    /// Export traces and metrics over OTLP.
    pub export: bool,
}

/// Keeps the exporters alive. Call `shutdown` before exiting to flush them.
#[must_use]
#[derive(Default)]
pub struct Telemetry {
    tracer_provider: Option<TracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl ObservabilityOptions {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Export is opt-in: an unset `OTEL_SDK_DISABLED` means disabled.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let log_format = match var(RUST_LOG_FORMAT).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        let directives = var(RUST_LOG)
            .filter(|directives| !directives.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DIRECTIVES.to_string());

        let export = var(OTEL_SDK_DISABLED)
            .map(|value| value.eq_ignore_ascii_case("false"))
            .unwrap_or(false);

        Self {
            log_format,
            directives,
            export,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.directives).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

impl Default for ObservabilityOptions {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            directives: DEFAULT_DIRECTIVES.to_string(),
            export: false,
        }
    }
}

impl Telemetry {
    pub fn is_exporting(&self) -> bool {
        self.tracer_provider.is_some() || self.meter_provider.is_some()
    }

    /// Flush pending spans and metrics. Errors are logged, not returned.
    pub fn shutdown(self) {
        if let Some(provider) = self.meter_provider {
            if let Err(err) = provider.shutdown() {
                tracing::warn!(error = %err, "failed to flush metrics");
            }
        }

        if let Some(provider) = self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                tracing::warn!(error = %err, "failed to flush traces");
            }
        }
    }
}

/// Returns a meter from the global meter provider.
///
/// When OTLP export is disabled this is a no-op meter.
pub fn meter(name: &'static str) -> Meter {
    global::meter(name)
}

/// Install the global tracing subscriber, configured from the environment.
///
/// Must be called once, from inside the tokio runtime, before any other
/// component logs.
///
/// ```rs
/// use comet_backfill_observability::init_opentelemetry;
///
/// let telemetry = init_opentelemetry(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")).unwrap();
/// // ...
/// telemetry.shutdown();
/// ```
pub fn init_opentelemetry(
    package_name: impl Into<Cow<'static, str>>,
    package_version: impl Into<Cow<'static, str>>,
) -> Result<Telemetry, ObservabilityInitError> {
    init_with_options(
        &ObservabilityOptions::from_env(),
        package_name,
        package_version,
    )
}

pub fn init_with_options(
    options: &ObservabilityOptions,
    package_name: impl Into<Cow<'static, str>>,
    package_version: impl Into<Cow<'static, str>>,
) -> Result<Telemetry, ObservabilityInitError> {
    let mut layers = vec![stdout(options)];
    let mut telemetry = Telemetry::default();

    if options.export {
        let (layer, tracer_provider, meter_provider) =
            otel(options, package_name, package_version)?;
        layers.push(layer);
        telemetry.tracer_provider = Some(tracer_provider);
        telemetry.meter_provider = Some(meter_provider);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .change_context(ObservabilityInitError)
        .attach_printable("a global subscriber is already installed")?;

    Ok(telemetry)
}

fn otel<S>(
    options: &ObservabilityOptions,
    package_name: impl Into<Cow<'static, str>>,
    version: impl Into<Cow<'static, str>>,
) -> Result<(BoxedLayer<S>, TracerProvider, SdkMeterProvider), ObservabilityInitError>
where
    S: Subscriber + Send + Sync,
    for<'a> S: LookupSpan<'a>,
{
    let resource = SdkProvidedResourceDetector.detect(Duration::from_secs(1));
    let scope = InstrumentationScope::builder(package_name.into())
        .with_version(version.into())
        .build();

    let span_exporter = SpanExporter::builder()
        .with_tonic()
        .build()
        .change_context(ObservabilityInitError)
        .attach_printable("failed to create span exporter")?;

    let tracer_provider = TracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio)
        .build();

    let tracer = tracer_provider.tracer_with_scope(scope);

    let metric_exporter = MetricExporter::builder()
        .with_tonic()
        .build()
        .change_context(ObservabilityInitError)
        .attach_printable("failed to create metric exporter")?;

    let reader = PeriodicReader::builder(metric_exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(METRICS_EXPORT_INTERVAL)
        .build();

    let meter_provider = MeterProviderBuilder::default()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    global::set_meter_provider(meter_provider.clone());

    let layer = tracing_opentelemetry::layer()
        .with_tracer(tracer)
        .and_then(MetricsLayer::new(meter_provider.clone()))
        .and_then(options.env_filter())
        .boxed();

    Ok((layer, tracer_provider, meter_provider))
}

fn stdout<S>(options: &ObservabilityOptions) -> BoxedLayer<S>
where
    S: Subscriber,
    for<'a> S: LookupSpan<'a>,
{
    match options.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .json()
            .with_filter(options.env_filter())
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_filter(options.env_filter())
            .boxed(),
    }
}
