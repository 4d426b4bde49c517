//! Global `tracing` setup for processes that embed the engine.
//!
//! ```no_run
//! use weft_observe::tracing_setup::{TracingOptions, init_with, shutdown_tracing};
//!
//! init_with(&TracingOptions::default().json(true)).expect("tracing");
//! // ... run flows ...
//! shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Instrumentation scope and `service.name` reported to OpenTelemetry.
pub const TRACER_NAME: &str = "weft";

/// Filter used when `RUST_LOG` is unset: run lifecycle at info, the event
/// mirror off.
pub const DEFAULT_FILTER: &str = "weft_core=info,weft::events=off";

/// How the global subscriber is assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingOptions {
    /// Bridge spans to OpenTelemetry (stdout exporter).
    pub enable_otel: bool,
    /// One JSON object per line instead of the human-readable format.
    pub json: bool,
    /// Directives applied when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            enable_otel: false,
            json: false,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TracingOptions {
    pub fn otel(mut self, enable: bool) -> Self {
        self.enable_otel = enable;
        self
    }

    pub fn json(mut self, enable: bool) -> Self {
        self.json = enable;
        self
    }

    /// Replace the fallback directives, e.g. `"weft_core=debug,weft::events=debug"`
    /// to see every mirrored hub event.
    pub fn default_filter(mut self, directives: impl Into<String>) -> Self {
        self.default_filter = directives.into();
        self
    }
}

/// `RUST_LOG` when set, otherwise `fallback`. Invalid directives are an error
/// rather than being silently dropped.
fn build_filter(
    env: Option<&str>,
    fallback: &str,
) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    match env {
        Some(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(fallback),
    }
}

fn tracer_provider() -> SdkTracerProvider {
    let resource = Resource::builder().with_service_name(TRACER_NAME).build();
    SdkTracerProvider::builder()
        .with_resource(resource)
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .build()
}

/// Install the global subscriber described by `options`.
///
/// # Errors
///
/// Returns an error for unparseable filter directives or when a global
/// subscriber is already installed.
pub fn init_with(options: &TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(env.as_deref(), &options.default_filter)?;

    let text_layer = (!options.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
    });
    let json_layer = options.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
    });
    let otel_layer = options.enable_otel.then(|| {
        let provider = tracer_provider();
        let tracer = provider.tracer(TRACER_NAME);
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;
    Ok(())
}

/// Human-readable logging, optionally bridged to OpenTelemetry.
pub fn init_tracing(enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    init_with(&TracingOptions::default().otel(enable_otel))
}

/// Flush pending spans and shut down the OpenTelemetry provider.
/// No-op when OpenTelemetry was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = TracingOptions::default()
            .otel(true)
            .json(true)
            .default_filter("weft_core=debug");
        assert!(options.enable_otel);
        assert!(options.json);
        assert_eq!(options.default_filter, "weft_core=debug");
        assert_eq!(TracingOptions::default().default_filter, DEFAULT_FILTER);
    }

    #[test]
    fn test_filter_prefers_env_directives() {
        let filter = build_filter(Some("weft_core=trace"), DEFAULT_FILTER).unwrap();
        assert!(filter.to_string().contains("weft_core=trace"));

        let filter = build_filter(Some("  "), DEFAULT_FILTER).unwrap();
        assert!(filter.to_string().contains("weft_core=info"));
    }

    #[test]
    fn test_filter_rejects_bad_directives() {
        assert!(build_filter(None, "weft_core=loud").is_err());
        assert!(build_filter(None, DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn test_shutdown_without_init_is_noop() {
        shutdown_tracing();
        assert!(TRACER_PROVIDER.get().is_none());
    }
}
