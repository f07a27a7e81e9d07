//! # Event Engine
//!
//! Events are appended to a stream and read by consumer groups. Each
//! listener registration is its own group, so every registration sees
//! every event while processes sharing a registration split the work.

pub mod handler;
pub(crate) mod listener;

pub use handler::{event_fn, event_typed, EventHandler, FnEventHandler, TypedEventHandler};
pub use listener::{EventReceipt, ListenOptions};
