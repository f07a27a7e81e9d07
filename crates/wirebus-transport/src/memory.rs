//! # In-Memory Broker
//!
//! A process-local broker with the same stream and consumer-group semantics
//! as the Redis transport. Any number of [`InMemoryTransport`] handles may
//! share one [`InMemoryBroker`], each behaving like a separate connection.
//!
//! The broker can be marked unavailable to simulate an outage: every
//! operation on every handle then fails with
//! [`TransportError::ConnectionLost`] until it is marked available again.

use crate::transport::{ReadCursor, StartPosition, StreamEntry, Transport, TransportResult};
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use wirebus_types::{now_ms, EntryId, TransportError};

/// Default approximate cap on entries retained per channel.
pub const DEFAULT_MAX_STREAM_LENGTH: usize = 100_000;

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<EntryId, Arc<[u8]>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
    expires_at: Option<Instant>,
}

struct Lease {
    holder: String,
    expires_at: Instant,
}

#[derive(Default)]
struct BrokerState {
    streams: HashMap<String, Stream>,
    leases: HashMap<String, Lease>,
}

impl BrokerState {
    fn drop_expired(&mut self, now: Instant) {
        self.streams
            .retain(|_, stream| stream.expires_at.map_or(true, |at| at > now));
    }
}

fn no_group(channel: &str, group: &str) -> TransportError {
    TransportError::GroupMissing(format!(
        "no such consumer group '{group}' for channel '{channel}'"
    ))
}

/// Shared in-memory broker state.
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    available: AtomicBool,
    max_stream_length: usize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_stream_length(DEFAULT_MAX_STREAM_LENGTH)
    }

    #[must_use]
    pub fn with_max_stream_length(max_stream_length: usize) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
            max_stream_length: max_stream_length.max(1),
        }
    }

    /// Lock the state, dropping channels whose deadline has passed.
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        let mut state = self.state.lock();
        state.drop_expired(Instant::now());
        state
    }

    /// Open a new connection to this broker.
    pub fn connect(self: &Arc<Self>) -> InMemoryTransport {
        InMemoryTransport {
            broker: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate the broker going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        debug!(available, "In-memory broker availability changed");
        self.notify.notify_waiters();
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of entries retained by `channel`.
    pub fn stream_len(&self, channel: &str) -> usize {
        self.lock()
            .streams
            .get(channel)
            .map_or(0, |s| s.entries.len())
    }

    /// Payloads retained by `channel`, oldest first.
    pub fn entries(&self, channel: &str) -> Vec<(EntryId, Arc<[u8]>)> {
        self.lock()
            .streams
            .get(channel)
            .map(|s| s.entries.iter().map(|(id, p)| (*id, Arc::clone(p))).collect())
            .unwrap_or_default()
    }

    /// Number of unacknowledged entries of `group` on `channel`.
    pub fn pending_count(&self, channel: &str, group: &str) -> usize {
        self.lock()
            .streams
            .get(channel)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Time left before `channel` expires, if it has a deadline.
    pub fn time_to_live(&self, channel: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .streams
            .get(channel)
            .and_then(|s| s.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    pub fn group_exists(&self, channel: &str, group: &str) -> bool {
        self.lock()
            .streams
            .get(channel)
            .is_some_and(|s| s.groups.contains_key(group))
    }

    fn append(&self, channel: &str, payload: &[u8]) -> EntryId {
        let id = {
            let mut state = self.lock();
            let stream = state.streams.entry(channel.to_string()).or_default();
            let id = stream.last_id.next_after(now_ms());
            stream.last_id = id;
            stream.entries.insert(id, Arc::from(payload));
            while stream.entries.len() > self.max_stream_length {
                stream.entries.pop_first();
            }
            id
        };
        self.notify.notify_waiters();
        id
    }

    fn create_group(&self, channel: &str, group: &str, start: StartPosition) -> bool {
        let mut state = self.lock();
        let stream = state.streams.entry(channel.to_string()).or_default();
        if stream.groups.contains_key(group) {
            return false;
        }
        let last_delivered = match start {
            StartPosition::Latest => stream.last_id,
            StartPosition::Beginning => EntryId::ZERO,
            StartPosition::After(id) => id,
        };
        stream.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        true
    }

    fn read_new(
        &self,
        channels: &[String],
        group: &str,
        consumer: &str,
        count: usize,
    ) -> TransportResult<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut state = self.lock();
        let mut batch = Vec::new();

        for channel in channels {
            let Stream { entries, groups, .. } = state
                .streams
                .get_mut(channel)
                .ok_or_else(|| no_group(channel, group))?;
            let group_state = groups
                .get_mut(group)
                .ok_or_else(|| no_group(channel, group))?;

            let range = (Bound::Excluded(group_state.last_delivered), Bound::Unbounded);
            for (id, payload) in entries.range(range) {
                if batch.len() >= count {
                    break;
                }
                group_state.last_delivered = *id;
                group_state.pending.insert(
                    *id,
                    PendingEntry {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        delivery_count: 1,
                    },
                );
                batch.push(StreamEntry {
                    channel: channel.clone(),
                    id: *id,
                    payload: Arc::clone(payload),
                    delivery_count: 1,
                });
            }
        }
        Ok(batch)
    }

    fn read_pending(
        &self,
        channels: &[String],
        group: &str,
        consumer: &str,
        count: usize,
    ) -> TransportResult<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut state = self.lock();
        let mut batch = Vec::new();

        for channel in channels {
            let Stream { entries, groups, .. } = state
                .streams
                .get_mut(channel)
                .ok_or_else(|| no_group(channel, group))?;
            let group_state = groups
                .get_mut(group)
                .ok_or_else(|| no_group(channel, group))?;

            let mut trimmed = Vec::new();
            for (id, pending) in group_state.pending.iter_mut() {
                if batch.len() >= count {
                    break;
                }
                if pending.consumer != consumer {
                    continue;
                }
                let Some(payload) = entries.get(id) else {
                    trimmed.push(*id);
                    continue;
                };
                pending.delivery_count += 1;
                pending.delivered_at = now;
                batch.push(StreamEntry {
                    channel: channel.clone(),
                    id: *id,
                    payload: Arc::clone(payload),
                    delivery_count: pending.delivery_count,
                });
            }
            for id in trimmed {
                group_state.pending.remove(&id);
            }
        }
        Ok(batch)
    }

    fn ack(&self, channel: &str, group: &str, id: EntryId) {
        let mut state = self.lock();
        if let Some(group_state) = state
            .streams
            .get_mut(channel)
            .and_then(|s| s.groups.get_mut(group))
        {
            group_state.pending.remove(&id);
        }
    }

    fn claim(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> TransportResult<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut state = self.lock();
        let Stream { entries, groups, .. } = state
            .streams
            .get_mut(channel)
            .ok_or_else(|| no_group(channel, group))?;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| no_group(channel, group))?;

        let mut claimed = Vec::new();
        let mut trimmed = Vec::new();
        for (id, pending) in group_state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.saturating_duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            let Some(payload) = entries.get(id) else {
                trimmed.push(*id);
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            claimed.push(StreamEntry {
                channel: channel.to_string(),
                id: *id,
                payload: Arc::clone(payload),
                delivery_count: pending.delivery_count,
            });
        }
        for id in trimmed {
            group_state.pending.remove(&id);
        }
        Ok(claimed)
    }

    fn touch(&self, channel: &str, group: &str, consumer: &str, id: EntryId) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        let pending = state
            .streams
            .get_mut(channel)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.get_mut(&id));
        match pending {
            Some(pending) if pending.consumer == consumer => {
                pending.delivered_at = now;
                true
            }
            _ => false,
        }
    }

    fn expire(&self, channel: &str, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        if let Some(stream) = self.lock().streams.get_mut(channel) {
            stream.expires_at = Some(deadline);
        }
    }

    fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        match state.leases.get_mut(key) {
            Some(lease) if lease.holder != holder && lease.expires_at > now => false,
            Some(lease) => {
                lease.holder = holder.to_string();
                lease.expires_at = now + ttl;
                true
            }
            None => {
                state.leases.insert(
                    key.to_string(),
                    Lease {
                        holder: holder.to_string(),
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }

    /// Current holder of lease `key`, if it has not lapsed.
    pub fn lease_holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.lock()
            .leases
            .get(key)
            .filter(|l| l.expires_at > now)
            .map(|l| l.holder.clone())
    }

    fn release_lease(&self, key: &str, holder: &str) {
        let mut state = self.lock();
        if state.leases.get(key).is_some_and(|l| l.holder == holder) {
            state.leases.remove(key);
        }
    }
}

/// One connection to an [`InMemoryBroker`].
pub struct InMemoryTransport {
    broker: Arc<InMemoryBroker>,
    closed: AtomicBool,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// A connection to a fresh, private broker.
    #[must_use]
    pub fn new() -> Self {
        Arc::new(InMemoryBroker::new()).connect()
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    fn check(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.broker.is_available() {
            return Err(TransportError::ConnectionLost(
                "in-memory broker unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn open(&self) -> TransportResult<()> {
        self.check()
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> TransportResult<EntryId> {
        self.check()?;
        let id = self.broker.append(channel, payload);
        debug!(channel, id = %id, bytes = payload.len(), "Entry published");
        Ok(id)
    }

    async fn ensure_group(
        &self,
        channel: &str,
        group: &str,
        start: StartPosition,
    ) -> TransportResult<()> {
        self.check()?;
        if self.broker.create_group(channel, group, start) {
            debug!(channel, group, ?start, "Consumer group created");
        }
        Ok(())
    }

    async fn read_group(
        &self,
        channels: &[String],
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> TransportResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking state so a publish between the
            // check and the wait is not missed.
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check()?;
            let batch = match cursor {
                ReadCursor::New => self.broker.read_new(channels, group, consumer, count)?,
                ReadCursor::Pending => {
                    return self.broker.read_pending(channels, group, consumer, count)
                }
            };
            if !batch.is_empty() || block.is_zero() {
                return Ok(batch);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, channel: &str, group: &str, id: EntryId) -> TransportResult<()> {
        self.check()?;
        self.broker.ack(channel, group, id);
        Ok(())
    }

    async fn claim_stale(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> TransportResult<Vec<StreamEntry>> {
        self.check()?;
        let claimed = self.broker.claim(channel, group, consumer, min_idle, count)?;
        if !claimed.is_empty() {
            debug!(channel, group, consumer, claimed = claimed.len(), "Claimed stale entries");
        }
        Ok(claimed)
    }

    async fn touch(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        id: EntryId,
    ) -> TransportResult<bool> {
        self.check()?;
        Ok(self.broker.touch(channel, group, consumer, id))
    }

    async fn expire(&self, channel: &str, ttl: Duration) -> TransportResult<()> {
        self.check()?;
        self.broker.expire(channel, ttl);
        Ok(())
    }

    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> TransportResult<bool> {
        self.check()?;
        Ok(self.broker.acquire_lease(key, holder, ttl))
    }

    async fn lease_holder(&self, key: &str) -> TransportResult<Option<String>> {
        self.check()?;
        Ok(self.broker.lease_holder(key))
    }

    async fn release_lease(&self, key: &str, holder: &str) -> TransportResult<()> {
        self.check()?;
        self.broker.release_lease(key, holder);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
