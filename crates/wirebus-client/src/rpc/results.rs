//! Caller side of the RPC engine: publishes calls and matches results.

use crate::rpc::pending::PendingCallStore;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use wirebus_telemetry::{metric_inc, metric_observe, CALL_DURATION, RPC_CALLS_SENT, RPC_TIMEOUTS};
use wirebus_transport::{Disposition, EntryHandler, StreamEntry, Transport};
use wirebus_types::channels::rpc_queue;
use wirebus_types::{decode, encode, BusError, CallMessage, CallOutcome, ResultMessage};

/// Completes pending calls from this process's results channel.
pub(crate) struct ResultListener {
    pending: Arc<PendingCallStore>,
}

impl ResultListener {
    pub(crate) fn new(pending: Arc<PendingCallStore>) -> Self {
        Self { pending }
    }
}

#[async_trait]
impl EntryHandler for ResultListener {
    async fn handle(&self, entry: &StreamEntry) -> Disposition {
        match decode::<ResultMessage>(&entry.payload) {
            Ok(result) => {
                self.pending.complete(result);
            }
            Err(e) => warn!(
                channel = %entry.channel,
                id = %entry.id,
                error = %e,
                "Discarding undecodable result"
            ),
        }
        Disposition::Ack
    }
}

/// Publishes calls and waits for their results.
pub(crate) struct RpcCaller {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingCallStore>,
}

impl RpcCaller {
    pub(crate) fn new(transport: Arc<dyn Transport>, pending: Arc<PendingCallStore>) -> Self {
        Self { transport, pending }
    }

    /// Publish `call` and wait up to `timeout` for its result.
    pub(crate) async fn call(
        &self,
        call: CallMessage,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let api = call.api_name.clone();
        let method = call.procedure_name.clone();
        let call_id = call.id;

        let rx = self.pending.register(call_id, &call.canonical_name(), timeout);
        let published = match encode(&call) {
            Ok(payload) => self
                .transport
                .publish(&rpc_queue(&api), &payload)
                .await
                .map_err(BusError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            self.pending.cancel(&call_id);
            return Err(e);
        }
        metric_inc!(RPC_CALLS_SENT, &[api.as_str()]);
        debug!(call = %call.canonical_name(), call_id = %call_id, "Published call");

        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => return Err(BusError::Shutdown),
            Err(_) => {
                self.pending.expire(&call_id);
                metric_inc!(RPC_TIMEOUTS, &[api.as_str()]);
                warn!(
                    call = %call.canonical_name(),
                    call_id = %call_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Call timed out"
                );
                return Err(BusError::Timeout {
                    api,
                    method,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };
        metric_observe!(CALL_DURATION, &[api.as_str()], started.elapsed().as_secs_f64());

        match result.outcome {
            CallOutcome::Ok(value) => Ok(value),
            CallOutcome::Error(info) if info.kind == "SchemaMismatch" => {
                Err(BusError::SchemaMismatch {
                    api,
                    member: method,
                    reason: info.message,
                })
            }
            CallOutcome::Error(info) => Err(BusError::RemoteError {
                api,
                method,
                kind: info.kind,
                message: info.message,
            }),
        }
    }
}
