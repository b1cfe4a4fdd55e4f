use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    pub service_name: String,
    pub json_logs: bool,
    /// OTLP/HTTP collector. Ignored unless built with `otel`.
    pub otlp_endpoint: Option<String>,
}

/// Keeps span export alive; flushes on drop.
#[derive(Debug)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn fmt_layer<S>(json_logs: bool) -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    }
}

/// Installs the global subscriber: `RUST_LOG` filter (default `info`), a
/// text or JSON fmt layer, and OTLP span export when an endpoint is given
/// and the `otel` feature is on.
pub fn init_tracing(
    options: &TelemetryOptions,
) -> Result<TelemetryGuard, Box<dyn std::error::Error + Send + Sync>> {
    #[cfg(feature = "otel")]
    if let Some(endpoint) = options.otlp_endpoint.as_deref() {
        return init_with_otlp(options, endpoint);
    }

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(options.json_logs))
        .try_init()?;

    Ok(TelemetryGuard {
        #[cfg(feature = "otel")]
        provider: None,
    })
}

#[cfg(feature = "otel")]
fn init_with_otlp(
    options: &TelemetryOptions,
    endpoint: &str,
) -> Result<TelemetryGuard, Box<dyn std::error::Error + Send + Sync>> {
    use opentelemetry::global;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::{SpanExporter, WithExportConfig as _};
    use opentelemetry_sdk::Resource;

    let exporter = SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint.to_string())
        .build()?;

    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder_empty()
                .with_service_name(options.service_name.clone())
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer(options.service_name.clone());
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(options.json_logs))
        .with(otel_layer)
        .try_init()?;

    Ok(TelemetryGuard {
        provider: Some(provider),
    })
}
