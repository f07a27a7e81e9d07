//! Prometheus metrics for bus processes.
//!
//! All metrics follow the naming convention: `wirebus_<area>_<metric>_<unit>`

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // RPC METRICS
    // =========================================================================

    /// Calls published by this process
    pub static ref RPC_CALLS_SENT: CounterVec = CounterVec::new(
        Opts::new("wirebus_rpc_calls_sent_total", "Calls published by this process"),
        &["api"]
    ).expect("metric creation failed");

    /// Calls handled by this process
    pub static ref RPC_CALLS_SERVED: CounterVec = CounterVec::new(
        Opts::new("wirebus_rpc_calls_served_total", "Calls handled by this process"),
        &["api", "outcome"]  // outcome: ok/error
    ).expect("metric creation failed");

    /// Calls that got no result in time
    pub static ref RPC_TIMEOUTS: CounterVec = CounterVec::new(
        Opts::new("wirebus_rpc_timeouts_total", "Calls that timed out waiting for a result"),
        &["api"]
    ).expect("metric creation failed");

    /// Round trip time of calls, as seen by the caller
    pub static ref CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "wirebus_rpc_call_duration_seconds",
            "Time from publishing a call to receiving its result"
        ).buckets(exponential_buckets(0.0005, 2.0, 16).expect("valid buckets")),
        &["api"]
    ).expect("metric creation failed");

    /// Calls awaiting a result
    pub static ref PENDING_CALLS: Gauge = Gauge::new(
        "wirebus_rpc_pending_calls",
        "Calls currently awaiting a result"
    ).expect("metric creation failed");

    // =========================================================================
    // EVENT METRICS
    // =========================================================================

    /// Events fired by this process
    pub static ref EVENTS_FIRED: CounterVec = CounterVec::new(
        Opts::new("wirebus_events_fired_total", "Events fired by this process"),
        &["api", "event"]
    ).expect("metric creation failed");

    /// Events handled successfully
    pub static ref EVENTS_PROCESSED: CounterVec = CounterVec::new(
        Opts::new("wirebus_events_processed_total", "Events handled successfully"),
        &["api", "event"]
    ).expect("metric creation failed");

    /// Event handler failures
    pub static ref EVENTS_FAILED: CounterVec = CounterVec::new(
        Opts::new("wirebus_events_failed_total", "Event handler failures"),
        &["api", "event"]
    ).expect("metric creation failed");

    // =========================================================================
    // TRANSPORT METRICS
    // =========================================================================

    /// Entries moved to a dead letter channel
    pub static ref DEAD_LETTERED: CounterVec = CounterVec::new(
        Opts::new("wirebus_entries_dead_lettered_total", "Entries moved to a dead letter channel"),
        &["channel"]
    ).expect("metric creation failed");

    /// Consumer reconnection attempts
    pub static ref RECONNECTS: CounterVec = CounterVec::new(
        Opts::new("wirebus_consumer_reconnects_total", "Consumer reconnection attempts"),
        &["group"]
    ).expect("metric creation failed");
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(RPC_CALLS_SENT.clone()),
        Box::new(RPC_CALLS_SERVED.clone()),
        Box::new(RPC_TIMEOUTS.clone()),
        Box::new(CALL_DURATION.clone()),
        Box::new(PENDING_CALLS.clone()),
        Box::new(EVENTS_FIRED.clone()),
        Box::new(EVENTS_PROCESSED.clone()),
        Box::new(EVENTS_FAILED.clone()),
        Box::new(DEAD_LETTERED.clone()),
        Box::new(RECONNECTS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
