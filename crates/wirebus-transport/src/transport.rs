//! # Transport
//!
//! Durable append-only channels with consumer groups.
//!
//! A *channel* is a named stream. Entries are appended with [`Transport::publish`]
//! and receive a totally ordered [`EntryId`]. A *consumer group* is a named
//! cursor over a channel: each group receives every entry once, spread across
//! the consumers reading in that group. Delivered entries stay *pending* for
//! their consumer until acknowledged, and can be claimed by another consumer
//! once they have been idle long enough.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use wirebus_types::{EntryId, TransportError};

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only entries appended after the group is created.
    #[default]
    Latest,
    /// Every entry still retained by the channel.
    Beginning,
    /// Entries after the given id.
    After(EntryId),
}

/// Which entries a group read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to the group. They become pending for the
    /// reading consumer.
    New,
    /// The reading consumer's own unacknowledged entries.
    Pending,
}

/// An entry delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub channel: String,
    pub id: EntryId,
    pub payload: Arc<[u8]>,
    /// How many times the entry has been delivered within its group,
    /// including this delivery.
    pub delivery_count: u32,
}

impl StreamEntry {
    /// Key identifying the entry within a group.
    pub fn key(&self) -> (String, EntryId) {
        (self.channel.clone(), self.id)
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A broker connection shared by every loop of a process.
///
/// Implementations serialize their own mutation; callers may use one handle
/// from many tasks concurrently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Verify the broker is reachable.
    async fn open(&self) -> TransportResult<()>;

    /// Append `payload` to `channel`, creating it if needed. Returns once the
    /// broker has stored the entry.
    async fn publish(&self, channel: &str, payload: &[u8]) -> TransportResult<EntryId>;

    /// Create `group` on `channel` if it does not exist yet.
    async fn ensure_group(
        &self,
        channel: &str,
        group: &str,
        start: StartPosition,
    ) -> TransportResult<()>;

    /// Read up to `count` entries across `channels` for `consumer` in `group`.
    ///
    /// With [`ReadCursor::New`] this waits up to `block` for entries to
    /// arrive and returns an empty batch on timeout.
    async fn read_group(
        &self,
        channels: &[String],
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> TransportResult<Vec<StreamEntry>>;

    /// Acknowledge an entry, removing it from the group's pending list.
    async fn ack(&self, channel: &str, group: &str, id: EntryId) -> TransportResult<()>;

    /// Take over entries of `group` that have been pending for at least
    /// `min_idle`, regardless of their current owner.
    async fn claim_stale(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> TransportResult<Vec<StreamEntry>>;

    /// Reset the idle time of `id` while it is pending for `consumer`, so
    /// other members of the group do not claim it. Returns `false` when
    /// the entry is no longer pending for `consumer`.
    async fn touch(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        id: EntryId,
    ) -> TransportResult<bool>;

    /// Delete `channel` with its groups once `ttl` passes without another
    /// call to `expire`. Publishing does not extend the deadline. Does
    /// nothing if the channel does not exist.
    async fn expire(&self, channel: &str, ttl: Duration) -> TransportResult<()>;

    /// Take or renew the lease `key` for `holder`. Returns `false` when
    /// another holder owns an unexpired lease.
    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> TransportResult<bool>;

    /// Current holder of `key`, if the lease is live.
    async fn lease_holder(&self, key: &str) -> TransportResult<Option<String>>;

    /// Drop `key` if `holder` owns it.
    async fn release_lease(&self, key: &str, holder: &str) -> TransportResult<()>;

    /// Close this handle. Later operations fail with [`TransportError::Closed`].
    async fn close(&self) -> TransportResult<()>;

    /// Short description for logs.
    fn describe(&self) -> String;
}
