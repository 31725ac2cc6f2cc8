//! Logging and trace export.
//!
//! Logs go to stderr through `tracing-subscriber`, filtered by `RUST_LOG`
//! (default `info`). `TOWN_LOG_FORMAT=json` switches to one JSON object per
//! line. With the `otel` feature, spans and log events are also exported over
//! OTLP/HTTP whenever `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_FORMAT_ENV: &str = "TOWN_LOG_FORMAT";

#[cfg(feature = "otel")]
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Flushes exporters when dropped. Hold it for the life of `main`.
#[must_use]
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    tracer: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
    #[cfg(feature = "otel")]
    logger: Option<opentelemetry_sdk::logs::SdkLoggerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        {
            if let Some(tracer) = self.tracer.take()
                && let Err(e) = tracer.shutdown()
            {
                eprintln!("warning: trace exporter shutdown failed: {e}");
            }
            if let Some(logger) = self.logger.take()
                && let Err(e) = logger.shutdown()
            {
                eprintln!("warning: log exporter shutdown failed: {e}");
            }
        }
    }
}

fn json_requested() -> bool {
    std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init() -> TelemetryGuard {
    let json = json_requested();
    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "otel")]
    {
        let mut guard = TelemetryGuard::default();
        let (trace_layer, log_layer) = match otel::providers() {
            Ok(Some((tracer, logger))) => {
                use opentelemetry::trace::TracerProvider as _;
                let trace_layer =
                    tracing_opentelemetry::layer().with_tracer(tracer.tracer("town"));
                let log_layer =
                    opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
                        &logger,
                    );
                guard.tracer = Some(tracer);
                guard.logger = Some(logger);
                (Some(trace_layer), Some(log_layer))
            }
            Ok(None) => (None, None),
            Err(e) => {
                eprintln!("warning: OTLP export disabled: {e}");
                (None, None)
            }
        };

        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(json_layer)
            .with(text_layer)
            .with(trace_layer)
            .with(log_layer)
            .try_init();
        guard
    }

    #[cfg(not(feature = "otel"))]
    {
        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(json_layer)
            .with(text_layer)
            .try_init();
        TelemetryGuard::default()
    }
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry_otlp::{LogExporter, SpanExporter};
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::logs::SdkLoggerProvider;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    use super::OTLP_ENDPOINT_ENV;

    fn resource() -> Resource {
        Resource::builder()
            .with_service_name("town")
            .with_attribute(opentelemetry::KeyValue::new(
                "service.version",
                env!("CARGO_PKG_VERSION"),
            ))
            .build()
    }

    /// Exporters are configured from the standard `OTEL_*` environment.
    pub(super) fn providers() -> anyhow::Result<Option<(SdkTracerProvider, SdkLoggerProvider)>> {
        if !std::env::var(OTLP_ENDPOINT_ENV).is_ok_and(|v| !v.trim().is_empty()) {
            return Ok(None);
        }

        let span_exporter = SpanExporter::builder().with_http().build()?;
        let tracer = SdkTracerProvider::builder()
            .with_batch_exporter(span_exporter)
            .with_resource(resource())
            .build();

        let log_exporter = LogExporter::builder().with_http().build()?;
        let logger = SdkLoggerProvider::builder()
            .with_batch_exporter(log_exporter)
            .with_resource(resource())
            .build();

        Ok(Some((tracer, logger)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        let _first = init();
        let _second = init();
        tracing::info!("still logging");
    }
}
