//! # Wirebus Client
//!
//! Request/response procedures and fire-and-forget events between
//! independent processes, multiplexed over one durable stream transport.
//!
//! ```text
//! ┌──────────────────────────── BusClient ────────────────────────────┐
//! │  ApiRegistry      SchemaRegistry      PendingCallStore            │
//! │       │                 │                    ▲                    │
//! │  bind_rpc ──► RpcServer │  call ──► RpcCaller│◄── ResultListener  │
//! │  listen   ──► EventListener   fire ──────────┼─────────┐          │
//! └───────────────────────┬──────────────────────┴─────────┼──────────┘
//!                         ▼                                ▼
//!                    StreamConsumer ◄──────────────── Transport
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod events;
pub mod rpc;

pub use api::ApiRegistry;
pub use client::{ApiHandle, BusClient, BusClientBuilder};
pub use config::{BusConfig, ConsumerSettings, RpcServingMode};
pub use events::{event_fn, event_typed, EventHandler, EventReceipt, ListenOptions};
pub use rpc::{rpc_fn, rpc_typed, HandlerError, PendingCallStore, RpcHandler};

pub use wirebus_schema::{InMemorySchemaStore, SchemaRegistry, SchemaStore};
pub use wirebus_transport::{InMemoryBroker, InMemoryTransport, StartPosition, Transport};
pub use wirebus_types::{
    ApiDefinition, BusError, EventDeclaration, EventMessage, Kwargs, ParamType, Parameter,
    RpcSignature, StreamLayout,
};
