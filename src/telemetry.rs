//! Telemetry and structured logging for the conversion service.

use crate::pool::PoolStats;
use crate::request::{ConversionRequest, RequestStatus};
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};

const TRACER_NAME: &str = "pdfa-service";

/// Conversions slower than this are logged as a warning.
const SLOW_CONVERSION_MS: i64 = 30_000;

/// Records telemetry for a finished conversion request.
///
/// Emits one `pdfa_conversion` span plus a structured log line. Span
/// attributes:
/// - request id, source and status
/// - correlation key and original file name, once staged
/// - duration (ms) and the error message when the request failed
pub fn record_conversion_telemetry(request: &ConversionRequest) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("pdfa_conversion");

    span.set_attribute(KeyValue::new("request_id", request.request_id.clone()));
    span.set_attribute(KeyValue::new("source", request.source.to_string()));
    span.set_attribute(KeyValue::new("status", request.status.to_string()));

    if let Some(ref key) = request.correlation_key {
        span.set_attribute(KeyValue::new("correlation_key", key.clone()));
    }
    if let Some(ref name) = request.original_name {
        span.set_attribute(KeyValue::new("original_name", name.clone()));
    }

    if let Some(duration_ms) = request.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            request_id = %request.request_id,
            source = %request.source,
            duration_ms = duration_ms,
            status = %request.status,
            "PDF/A conversion finished"
        );

        if duration_ms > SLOW_CONVERSION_MS {
            warn!(
                request_id = %request.request_id,
                duration_ms = duration_ms,
                "PDF/A conversion exceeded {}ms",
                SLOW_CONVERSION_MS
            );
        }
    }

    if request.status == RequestStatus::Failed {
        if let Some(ref error) = request.error {
            span.set_attribute(KeyValue::new("error", error.clone()));
            warn!(
                request_id = %request.request_id,
                error = %error,
                "PDF/A conversion failed"
            );
        }
    }

    span.end();
}

/// Records a pool heartbeat. Called by the maintenance task.
pub fn record_pool_heartbeat(stats: &PoolStats) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("pool_heartbeat");

    span.set_attribute(KeyValue::new("idle", stats.idle as i64));
    span.set_attribute(KeyValue::new("in_use", stats.in_use as i64));
    span.set_attribute(KeyValue::new("live", stats.live as i64));
    span.set_attribute(KeyValue::new("max_total", stats.max_total as i64));
    span.end();

    info!(
        target: "pool",
        idle = stats.idle,
        in_use = stats.in_use,
        live = stats.live,
        created = stats.created,
        destroyed = stats.destroyed,
        "Pool heartbeat"
    );
}

/// Installs an OTLP trace pipeline exporting to `endpoint`.
///
/// Call once at startup, inside the tokio runtime. `OTEL_SERVICE_NAME`
/// overrides the reported service name (default: pdfa-service).
pub fn init_telemetry(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let service_name = std::env::var("OTEL_SERVICE_NAME")
        .unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}

/// Flushes pending spans. No-op when telemetry was never initialized.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestSource;

    fn stats() -> PoolStats {
        PoolStats {
            max_total: 10,
            min_idle: 3,
            idle: 2,
            in_use: 1,
            live: 3,
            created: 4,
            destroyed: 1,
            borrowed: 12,
        }
    }

    #[test]
    fn test_record_completed_conversion() {
        let mut request = ConversionRequest::new(RequestSource::Upload);
        request.start_converting();
        request.mark_complete();

        // No provider installed: spans go to the no-op tracer.
        record_conversion_telemetry(&request);
    }

    #[test]
    fn test_record_failed_conversion() {
        let mut request = ConversionRequest::new(RequestSource::Local);
        request.mark_failed("tool exited with status 3".to_string());

        record_conversion_telemetry(&request);
    }

    #[test]
    fn test_record_pool_heartbeat() {
        record_pool_heartbeat(&stats());
    }
}
