//! # Internal API
//!
//! `internal.metrics` lets any process on the bus read this process's
//! Prometheus counters with an ordinary call. Every process registering it
//! shares one queue, so the answer comes from whichever process takes it.
//! The API is always served in compete mode; an exclusive lease would let
//! only one node of a cluster start.

use serde_json::Value;
use wirebus_client::{rpc_fn, ApiDefinition, BusClient, BusError, ParamType, RpcSignature};

pub const METRICS_API: &str = "internal.metrics";

pub fn metrics_api() -> Result<ApiDefinition, BusError> {
    ApiDefinition::builder(METRICS_API)
        .rpc(RpcSignature::new("snapshot", Vec::<&str>::new()).returns(ParamType::Object))
        .build()
}

/// Register `internal.metrics` and bind its handler.
pub async fn install(bus: &BusClient) -> Result<(), BusError> {
    bus.register_api(metrics_api()?).await?;
    bus.serve_competing(METRICS_API);
    let service = bus.config().service_name.clone();
    let process = bus.config().process_name.clone();
    bus.bind_rpc(
        METRICS_API,
        "snapshot",
        rpc_fn(&[], move |_| {
            let service = service.clone();
            let process = process.clone();
            async move {
                let text = wirebus_telemetry::encode_metrics()?;
                Ok::<_, anyhow::Error>(serde_json::json!({
                    "service": service,
                    "process": process,
                    "metrics": Value::String(text),
                }))
            }
        }),
    )
    .await
}
