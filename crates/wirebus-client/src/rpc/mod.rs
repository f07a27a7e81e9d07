//! # RPC Engine
//!
//! ```text
//! caller                         rpc_queue                    server
//!   │ register(call_id)               │                          │
//!   │ publish(CallMessage) ──────────►│ read_group("rpc") ──────►│ validate + invoke
//!   │                                 │                          │
//!   │◄──── <service>.<process>:results ◄──── publish(ResultMessage)
//!   │ complete(call_id)                                          │ ack
//! ```

pub mod handler;
pub mod pending;
pub(crate) mod results;
pub(crate) mod server;

pub use handler::{rpc_fn, rpc_typed, FnRpcHandler, HandlerError, RpcHandler, TypedRpcHandler};
pub use pending::{cleanup_task, PendingCallStore, PendingStats};
