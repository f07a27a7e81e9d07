//! Serving side of the RPC engine.
//!
//! One [`RpcServer`] per served API consumes `<api>:rpc_queue`. Each call
//! is validated, handed to its handler and answered on the caller's
//! results channel. The call is acknowledged only once the answer has been
//! published.

use crate::rpc::handler::{HandlerError, RpcHandler};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use wirebus_schema::{validate_kwargs, SchemaError};
use wirebus_telemetry::{metric_inc, RPC_CALLS_SERVED};
use wirebus_transport::{Disposition, EntryHandler, StreamConsumer, StreamEntry, Transport};
use wirebus_types::{
    decode, encode, now_ms, ApiDefinition, BusError, CallMessage, ParamType, ResultMessage,
};

pub(crate) struct RpcServer {
    api: Arc<ApiDefinition>,
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
    transport: Arc<dyn Transport>,
    validate_incoming: bool,
    /// Expiry set on a results channel after answering into it.
    result_ttl: Duration,
}

impl RpcServer {
    pub(crate) fn new(
        api: Arc<ApiDefinition>,
        handlers: HashMap<String, Arc<dyn RpcHandler>>,
        transport: Arc<dyn Transport>,
        validate_incoming: bool,
        result_ttl: Duration,
    ) -> Self {
        Self {
            api,
            handlers,
            transport,
            validate_incoming,
            result_ttl,
        }
    }

    /// Run the call through validation and its handler.
    pub(crate) async fn execute(&self, call: &CallMessage) -> ResultMessage {
        let api = self.api.name();
        let result = self.answer(call).await;
        let outcome = match &result.outcome {
            wirebus_types::CallOutcome::Ok(_) => "ok",
            wirebus_types::CallOutcome::Error(_) => "error",
        };
        metric_inc!(RPC_CALLS_SERVED, &[api, outcome]);
        result
    }

    async fn answer(&self, call: &CallMessage) -> ResultMessage {
        let api = self.api.name();
        if call.api_name != api {
            return ResultMessage::failure(
                call,
                "ApiNotFound",
                format!("call for '{}' arrived on the queue of '{api}'", call.api_name),
            );
        }
        let (Some(handler), Some(signature)) = (
            self.handlers.get(&call.procedure_name),
            self.api.rpc(&call.procedure_name),
        ) else {
            return ResultMessage::failure(
                call,
                "UnknownProcedure",
                format!("API '{api}' has no procedure '{}'", call.procedure_name),
            );
        };

        if self.validate_incoming {
            let checked =
                validate_kwargs(api, &call.procedure_name, &signature.parameters, &call.kwargs);
            if let Err(err) = checked {
                warn!(call = %call.canonical_name(), error = %err, "Rejecting call");
                return ResultMessage::failure(call, "SchemaMismatch", mismatch_reason(err));
            }
        }

        match AssertUnwindSafe(handler.invoke(call.kwargs.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => {
                if let Some(kind) = signature.returns.filter(|_| self.validate_incoming) {
                    if !kind.accepts(&value) {
                        let reason = format!(
                            "return value expects {}, got {}",
                            kind.name(),
                            ParamType::describe(&value)
                        );
                        warn!(
                            call = %call.canonical_name(),
                            %reason,
                            "Handler returned wrong type"
                        );
                        return ResultMessage::failure(call, "SchemaMismatch", reason);
                    }
                }
                ResultMessage::success(call, value)
            }
            Ok(Err(err)) => {
                let err = HandlerError::from_anyhow(&err);
                warn!(
                    call = %call.canonical_name(),
                    kind = %err.kind,
                    message = %err.message,
                    "Handler failed"
                );
                ResultMessage::failure(call, err.kind, err.message)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(call = %call.canonical_name(), %message, "Handler panicked");
                ResultMessage::failure(call, "Panic", message)
            }
        }
    }
}

fn mismatch_reason(err: SchemaError) -> String {
    match err {
        SchemaError::Mismatch { reason, .. } => reason,
        other => other.to_string(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[async_trait]
impl EntryHandler for RpcServer {
    async fn handle(&self, entry: &StreamEntry) -> Disposition {
        let call: CallMessage = match decode(&entry.payload) {
            Ok(call) => call,
            Err(e) => {
                warn!(
                    channel = %entry.channel,
                    id = %entry.id,
                    error = %e,
                    "Discarding undecodable call"
                );
                return Disposition::Ack;
            }
        };

        if call.is_expired_at(now_ms()) {
            debug!(call = %call.canonical_name(), call_id = %call.id, "Dropping expired call");
            return Disposition::Ack;
        }

        let result = self.execute(&call).await;
        let payload = match encode(&result) {
            Ok(payload) => payload,
            Err(e) => {
                error!(call = %call.canonical_name(), error = %e, "Cannot encode result");
                return Disposition::Ack;
            }
        };

        match self.transport.publish(&call.reply_to, &payload).await {
            Ok(_) => {
                debug!(call = %call.canonical_name(), call_id = %call.id, "Answered call");
                // Results of a caller that went away must not outlive it.
                if let Err(e) = self.transport.expire(&call.reply_to, self.result_ttl).await {
                    debug!(reply_to = %call.reply_to, error = %e, "Cannot set results expiry");
                }
                Disposition::Ack
            }
            Err(e) => {
                warn!(
                    call = %call.canonical_name(),
                    reply_to = %call.reply_to,
                    error = %e,
                    "Cannot publish result, call stays pending"
                );
                Disposition::Retry
            }
        }
    }
}

/// Lease held while serving an API exclusively.
pub(crate) struct ServeLease {
    pub key: String,
    pub holder: String,
    pub ttl: Duration,
}

/// Serve one API until shutdown.
pub(crate) async fn serve(
    server: RpcServer,
    consumer: StreamConsumer,
    lease: Option<ServeLease>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BusError> {
    let api = server.api.name().to_string();
    let transport = server.transport.clone();

    let Some(lease) = lease else {
        info!(api = %api, "Serving API");
        return Ok(consumer.run(Arc::new(server), shutdown).await?);
    };

    if !transport.acquire_lease(&lease.key, &lease.holder, lease.ttl).await? {
        let holder = transport.lease_holder(&lease.key).await?.unwrap_or_default();
        return Err(BusError::ApiAlreadyServed { api, holder });
    }
    info!(api = %api, holder = %lease.holder, "Serving API exclusively");

    let result = tokio::select! {
        served = consumer.run(Arc::new(server), shutdown) => served.map_err(BusError::from),
        lost = renew_lease(transport.as_ref(), &api, &lease) => lost,
    };

    if let Err(e) = transport.release_lease(&lease.key, &lease.holder).await {
        debug!(api = %api, error = %e, "Could not release serving lease");
    }
    result
}

/// Renew the lease at a third of its TTL. Returns only when the lease has
/// been taken by another process.
async fn renew_lease(
    transport: &dyn Transport,
    api: &str,
    lease: &ServeLease,
) -> Result<(), BusError> {
    let mut interval = tokio::time::interval((lease.ttl / 3).max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        interval.tick().await;
        match transport.acquire_lease(&lease.key, &lease.holder, lease.ttl).await {
            Ok(true) => {}
            Ok(false) => {
                let holder = transport
                    .lease_holder(&lease.key)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                error!(api, %holder, "Lost serving lease");
                return Err(BusError::ApiAlreadyServed {
                    api: api.to_string(),
                    holder,
                });
            }
            Err(e) => warn!(api, error = %e, "Cannot renew serving lease"),
        }
    }
}
