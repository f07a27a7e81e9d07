//! # wirebus Transport
//!
//! Durable delivery of messages to named channels with consumer-group
//! semantics, and the consumer loop that drives handlers from them.
//!
//! ```text
//!  publish()                       read_group(">")
//! ─────────►  ┌────────────────┐  ──────────────►  consumer a ─┐
//!             │ channel stream │                               ├ group "dashboard-default"
//!             └────────────────┘  ──────────────►  consumer b ─┘
//!                      │
//!                      └───────────────────────►  consumer c ── group "audit-default"
//! ```
//!
//! Two implementations are provided:
//!
//! - [`InMemoryTransport`]: a process-local broker, used by tests and by
//!   single-process deployments (`memory://`).
//! - `RedisTransport` (feature `redis`): Redis streams (`redis://`).

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod backoff;
pub mod consumer;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use consumer::{ConsumerConfig, Disposition, EntryHandler, StreamConsumer};
pub use memory::{InMemoryBroker, InMemoryTransport, DEFAULT_MAX_STREAM_LENGTH};
#[cfg(feature = "redis")]
pub use redis_streams::RedisTransport;
pub use transport::{ReadCursor, StartPosition, StreamEntry, Transport, TransportResult};

use std::sync::Arc;
use wirebus_types::TransportError;

/// Open a transport from a URL.
///
/// `memory://` creates a fresh private broker. `redis://` and `rediss://`
/// need the `redis` feature.
pub async fn connect(url: &str, max_stream_length: usize) -> TransportResult<Arc<dyn Transport>> {
    let scheme = url.split("://").next().unwrap_or_default();
    let transport: Arc<dyn Transport> = match scheme {
        "memory" => {
            let broker = Arc::new(InMemoryBroker::with_max_stream_length(max_stream_length));
            Arc::new(broker.connect())
        }
        #[cfg(feature = "redis")]
        "redis" | "rediss" => Arc::new(RedisTransport::connect_with(url, max_stream_length).await?),
        _ => {
            return Err(TransportError::Broker(format!(
                "unsupported transport url '{url}'"
            )))
        }
    };
    transport.open().await?;
    Ok(transport)
}
