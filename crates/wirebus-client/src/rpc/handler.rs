//! Procedure handlers.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use wirebus_types::{from_kwargs, BusError, Kwargs};

/// Serves one procedure of an API.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Parameter names in declaration order. Checked against the schema
    /// when the handler is bound.
    fn parameter_names(&self) -> Vec<String>;

    /// Handle one call. A returned error is sent back to the caller as a
    /// remote error; its kind is taken from [`HandlerError`] or [`BusError`]
    /// when the error is one of those.
    async fn invoke(&self, kwargs: Kwargs) -> anyhow::Result<Value>;
}

/// Error with an explicit kind, reported to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Classify any handler failure for the wire.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(handler) = err.downcast_ref::<HandlerError>() {
            return handler.clone();
        }
        if let Some(bus) = err.downcast_ref::<BusError>() {
            return Self::new(bus.kind(), bus.to_string());
        }
        Self::new("Error", format!("{err:#}"))
    }
}

/// Handler built from an async closure over raw keyword arguments.
pub struct FnRpcHandler<F> {
    parameters: Vec<String>,
    f: F,
}

#[async_trait]
impl<F, Fut> RpcHandler for FnRpcHandler<F>
where
    F: Fn(Kwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn parameter_names(&self) -> Vec<String> {
        self.parameters.clone()
    }

    async fn invoke(&self, kwargs: Kwargs) -> anyhow::Result<Value> {
        (self.f)(kwargs).await
    }
}

/// Wrap an async closure taking keyword arguments.
pub fn rpc_fn<F, Fut>(parameters: &[&str], f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(Kwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnRpcHandler {
        parameters: parameters.iter().map(|p| p.to_string()).collect(),
        f,
    })
}

/// Handler whose arguments and result are typed structs.
pub struct TypedRpcHandler<A, R, F> {
    parameters: Vec<String>,
    f: F,
    _types: PhantomData<fn(A) -> R>,
}

#[async_trait]
impl<A, R, F, Fut> RpcHandler for TypedRpcHandler<A, R, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    fn parameter_names(&self) -> Vec<String> {
        self.parameters.clone()
    }

    async fn invoke(&self, kwargs: Kwargs) -> anyhow::Result<Value> {
        let args: A = from_kwargs(kwargs)?;
        let result = (self.f)(args).await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Wrap an async closure taking a deserialized argument struct.
pub fn rpc_typed<A, R, F, Fut>(parameters: &[&str], f: F) -> Arc<dyn RpcHandler>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    Arc::new(TypedRpcHandler {
        parameters: parameters.iter().map(|p| p.to_string()).collect(),
        f,
        _types: PhantomData,
    })
}
