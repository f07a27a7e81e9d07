//! # wirebus Telemetry
//!
//! Logging, optional OpenTelemetry trace export and Prometheus metrics for
//! processes attached to the bus.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wirebus_telemetry::{init_telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let _guard = init_telemetry(TelemetryConfig::from_env())
//!         .await
//!         .expect("Failed to init telemetry");
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | unset | OTLP collector; traces are only exported when set |
//! | `OTEL_SERVICE_NAME` | `wirebus` | Service name in traces |
//! | `WIREBUS_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `WIREBUS_JSON_LOGS` | `false` | JSON formatted logs |
//! | `WIREBUS_CONSOLE_OUTPUT` | `true` | Write logs to stdout |
//! | `WIREBUS_METRICS` | `false` | Register Prometheus metrics on startup |

mod config;
pub mod metrics;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use metrics::{
    encode_metrics, register_metrics, CALL_DURATION, DEAD_LETTERED, EVENTS_FAILED, EVENTS_FIRED,
    EVENTS_PROCESSED, PENDING_CALLS, RECONNECTS, RPC_CALLS_SENT, RPC_CALLS_SERVED, RPC_TIMEOUTS,
};
pub use tracing_setup::TracingGuard;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize tracing: {0}")]
    TracerInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),
}

/// Install the global subscriber and, if enabled, register metrics.
///
/// Returns a guard that must be held for the lifetime of the process. When
/// dropped, it flushes pending spans.
pub async fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    if config.metrics_enabled {
        register_metrics()?;
    }

    let tracing_guard = tracing_setup::init_tracing(&config)?;

    Ok(TelemetryGuard {
        _tracing: tracing_guard,
    })
}

/// Guard that keeps telemetry active. Drop to flush and shutdown.
pub struct TelemetryGuard {
    _tracing: TracingGuard,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::debug!("Shutting down telemetry");
    }
}

/// Increment a counter, optionally selecting label values.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}

/// Record an observation on a histogram.
#[macro_export]
macro_rules! metric_observe {
    ($metric:expr, $value:expr) => {
        $metric.observe($value)
    };
    ($metric:expr, $labels:expr, $value:expr) => {
        $metric.with_label_values($labels).observe($value)
    };
}
