//! Event listener handlers.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use wirebus_types::{from_kwargs, EventMessage};

/// Receives events for one listener registration.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Parameter names in declaration order. Every event the handler
    /// listens to must declare exactly these.
    fn parameter_names(&self) -> Vec<String>;

    /// Handle one event. An error leaves the event unacknowledged so it is
    /// delivered again.
    async fn handle(&self, event: EventMessage) -> anyhow::Result<()>;
}

pub struct FnEventHandler<F> {
    parameters: Vec<String>,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnEventHandler<F>
where
    F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn parameter_names(&self) -> Vec<String> {
        self.parameters.clone()
    }

    async fn handle(&self, event: EventMessage) -> anyhow::Result<()> {
        (self.f)(event).await
    }
}

/// Wrap an async closure receiving the whole event.
pub fn event_fn<F, Fut>(parameters: &[&str], f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnEventHandler {
        parameters: parameters.iter().map(|p| p.to_string()).collect(),
        f,
    })
}

pub struct TypedEventHandler<A, F> {
    parameters: Vec<String>,
    f: F,
    _args: PhantomData<fn(A)>,
}

#[async_trait]
impl<A, F, Fut> EventHandler for TypedEventHandler<A, F>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn parameter_names(&self) -> Vec<String> {
        self.parameters.clone()
    }

    async fn handle(&self, event: EventMessage) -> anyhow::Result<()> {
        let args: A = from_kwargs(event.kwargs)?;
        (self.f)(args).await
    }
}

/// Wrap an async closure receiving the event's arguments as a struct.
pub fn event_typed<A, F, Fut>(parameters: &[&str], f: F) -> Arc<dyn EventHandler>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(TypedEventHandler {
        parameters: parameters.iter().map(|p| p.to_string()).collect(),
        f,
        _args: PhantomData,
    })
}
