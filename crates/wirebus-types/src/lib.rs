//! # wirebus Types
//!
//! Domain types shared by every wirebus crate.
//!
//! ## Contents
//!
//! - **API definitions**: [`ApiDefinition`], [`RpcSignature`], [`EventDeclaration`]
//! - **Wire messages**: [`CallMessage`], [`ResultMessage`], [`EventMessage`]
//! - **Identifiers**: [`MessageId`] (UUID v7) and [`EntryId`] (stream position)
//! - **Channel naming**: [`channels`]
//! - **Errors**: [`BusError`], [`TransportError`]
//!
//! ## Design Principles
//!
//! - Messages are self-describing JSON so that any process (or language) can
//!   reconstruct keyword arguments and correlation ids.
//! - API definitions are validated once, at construction, and are immutable
//!   afterwards.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod api;
pub mod channels;
pub mod errors;
pub mod ids;
pub mod messages;

pub use api::{
    ApiBuilder, ApiDefinition, ApiName, EventDeclaration, ParamType, Parameter, RpcSignature,
};
pub use channels::StreamLayout;
pub use errors::{BusError, TransportError};
pub use ids::{EntryId, MessageId};
pub use messages::{
    decode, encode, from_kwargs, now_ms, to_kwargs, CallMessage, CallOutcome, EventMessage, Kwargs,
    RemoteErrorInfo, ResultMessage,
};

/// Current protocol version stamped on every message.
pub const PROTOCOL_VERSION: u16 = 1;
