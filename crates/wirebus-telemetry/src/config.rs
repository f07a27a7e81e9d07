//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for logging, tracing and metrics.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to exported spans
    pub service_name: String,

    /// OTLP collector endpoint; no spans are exported when `None`
    pub otlp_endpoint: Option<String>,

    /// Log level filter (trace, debug, info, warn, error) or a full directive
    pub log_level: String,

    /// Whether to write logs to stdout
    pub console_output: bool,

    /// Whether to format logs as JSON
    pub json_logs: bool,

    /// Whether to register Prometheus metrics
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "wirebus".to_string(),
            otlp_endpoint: None,
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
            metrics_enabled: false,
        }
    }
}

fn flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// - `OTEL_SERVICE_NAME`: Service name (default: wirebus)
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: Collector endpoint (default: unset)
    /// - `WIREBUS_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `WIREBUS_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `WIREBUS_JSON_LOGS`: Enable JSON logs (default: true in containers)
    /// - `WIREBUS_METRICS`: Register Prometheus metrics (default: false)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "wirebus".to_string()),

            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty()),

            log_level: env::var("WIREBUS_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: flag("WIREBUS_CONSOLE_OUTPUT").unwrap_or(true),

            json_logs: flag("WIREBUS_JSON_LOGS").unwrap_or(is_container),

            metrics_enabled: flag("WIREBUS_METRICS").unwrap_or(false),
        }
    }

    /// Use `service` as the span service name.
    #[must_use]
    pub fn for_service(mut self, service: &str) -> Self {
        self.service_name = service.to_string();
        self
    }
}
