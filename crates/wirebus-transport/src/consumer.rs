//! # Stream Consumer
//!
//! Drives one consumer-group subscription: creates the groups, replays the
//! consumer's own pending entries, then reads new entries and hands each to
//! an [`EntryHandler`] on its own task.
//!
//! Delivery is at-least-once:
//!
//! - An entry is acknowledged only after its handler returns
//!   [`Disposition::Ack`].
//! - [`Disposition::Retry`] keeps the entry pending and hands it to the
//!   handler again after `retry_delay`. Its idle time is reset so other
//!   members of the group leave it alone meanwhile.
//! - Entries abandoned by a crashed consumer of the same group are claimed
//!   once they have been idle for `claim_timeout`.
//! - With `max_deliveries` set, an entry that keeps failing is copied to
//!   `<channel>:dead` and acknowledged.
//!
//! Connection failures, and groups that vanished with an expired channel,
//! restart the subscription after a backoff delay. After
//! `max_reconnect_attempts` consecutive failures [`StreamConsumer::run`]
//! returns [`TransportError::RetriesExhausted`].

use crate::backoff::BackoffPolicy;
use crate::transport::{ReadCursor, StartPosition, StreamEntry, Transport, TransportResult};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use wirebus_telemetry::{metric_inc, DEAD_LETTERED, RECONNECTS};
use wirebus_types::channels::dead_letter_channel;
use wirebus_types::{EntryId, TransportError};

/// Upper bound on pending entries replayed when a subscription (re)starts.
/// Anything beyond is recovered by claiming.
const PENDING_REPLAY_LIMIT: usize = 1000;

/// What to do with an entry after handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing finished; acknowledge.
    Ack,
    /// Processing failed; leave pending and deliver again.
    Retry,
}

/// Processes entries delivered by a [`StreamConsumer`].
#[async_trait]
pub trait EntryHandler: Send + Sync + 'static {
    async fn handle(&self, entry: &StreamEntry) -> Disposition;
}

/// Settings for one consumer-group subscription.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub channels: Vec<String>,
    pub group: String,
    pub consumer: String,
    /// Start position for groups created by this consumer.
    pub start: StartPosition,
    /// Maximum entries fetched per read.
    pub batch_size: usize,
    /// How long a read waits for new entries. Bounds how quickly shutdown
    /// is noticed by transports that cannot be interrupted.
    pub block: Duration,
    /// Maximum entries handled at once.
    pub concurrency: usize,
    /// Delay before a failed entry is handled again.
    pub retry_delay: Duration,
    /// Idle time after which entries pending for any consumer of the group
    /// are claimed. `None` disables claiming.
    pub claim_timeout: Option<Duration>,
    /// Dead-letter entries after this many deliveries.
    pub max_deliveries: Option<u32>,
    pub backoff: BackoffPolicy,
    /// Consecutive failed reconnects before giving up. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl ConsumerConfig {
    pub fn new(
        channels: Vec<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            channels,
            group: group.into(),
            consumer: consumer.into(),
            start: StartPosition::Latest,
            batch_size: 10,
            block: Duration::from_secs(1),
            concurrency: 1,
            retry_delay: Duration::from_secs(1),
            claim_timeout: Some(Duration::from_secs(60)),
            max_deliveries: None,
            backoff: BackoffPolicy::default(),
            max_reconnect_attempts: Some(10),
        }
    }
}

/// Consumes a set of channels as one member of a consumer group.
pub struct StreamConsumer {
    transport: Arc<dyn Transport>,
    config: ConsumerConfig,
}

struct Shared {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn EntryHandler>,
    config: ConsumerConfig,
    /// Entries in flight or waiting for a retry. Replays and claims skip them.
    held: Mutex<HashSet<(String, EntryId)>>,
    retries: Mutex<Vec<(Instant, StreamEntry)>>,
    permits: Arc<Semaphore>,
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            error!(error = %e, "Entry handler task failed");
        }
    }
}

impl StreamConsumer {
    pub fn new(transport: Arc<dyn Transport>, config: ConsumerConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Consume until `shutdown` flips to `true` or a fatal error occurs.
    ///
    /// In-flight handlers are awaited before returning. Aborting the task
    /// running this future aborts them too.
    pub async fn run(
        self,
        handler: Arc<dyn EntryHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        let concurrency = self.config.concurrency.max(1);
        let shared = Arc::new(Shared {
            transport: self.transport,
            handler,
            config: self.config,
            held: Mutex::new(HashSet::new()),
            retries: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(concurrency)),
        });
        let cfg = &shared.config;

        info!(
            group = %cfg.group,
            consumer = %cfg.consumer,
            channels = ?cfg.channels,
            concurrency,
            "Consumer started"
        );

        let mut tasks = JoinSet::new();
        let mut failures: u32 = 0;

        let result = loop {
            if is_shutdown(&shutdown) {
                break Ok(());
            }
            match shared.consume(&mut tasks, &mut shutdown, &mut failures).await {
                Ok(()) => break Ok(()),
                Err(TransportError::Closed) if is_shutdown(&shutdown) => break Ok(()),
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    if let Some(max) = cfg.max_reconnect_attempts {
                        if failures > max {
                            error!(
                                group = %cfg.group,
                                attempts = max,
                                error = %err,
                                "Giving up on transport"
                            );
                            break Err(TransportError::RetriesExhausted {
                                attempts: max,
                                last_error: err.to_string(),
                            });
                        }
                    }
                    let delay = cfg.backoff.next(failures - 1);
                    warn!(
                        group = %cfg.group,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transport failure, reconnecting"
                    );
                    metric_inc!(RECONNECTS, &[cfg.group.as_str()]);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    error!(group = %cfg.group, error = %err, "Consumer failed");
                    break Err(err);
                }
            }
        };

        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        info!(group = %cfg.group, consumer = %cfg.consumer, "Consumer stopped");
        result
    }
}

impl Shared {
    async fn consume(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        shutdown: &mut watch::Receiver<bool>,
        failures: &mut u32,
    ) -> TransportResult<()> {
        let cfg = &self.config;

        for channel in &cfg.channels {
            self.transport
                .ensure_group(channel, &cfg.group, cfg.start)
                .await?;
        }

        let pending = self
            .transport
            .read_group(
                &cfg.channels,
                &cfg.group,
                &cfg.consumer,
                ReadCursor::Pending,
                PENDING_REPLAY_LIMIT,
                Duration::ZERO,
            )
            .await?;
        *failures = 0;

        let replay: Vec<_> = pending.into_iter().filter(|e| self.admit(e)).collect();
        if !replay.is_empty() {
            info!(group = %cfg.group, count = replay.len(), "Replaying pending entries");
        }
        for entry in replay {
            if !self.dispatch(tasks, entry, shutdown).await? {
                return Ok(());
            }
        }

        let mut next_claim = cfg.claim_timeout.map(|t| Instant::now() + t);

        loop {
            if is_shutdown(shutdown) {
                return Ok(());
            }
            while let Some(Some(joined)) = tasks.join_next().now_or_never() {
                log_join(joined);
            }

            for entry in self.take_due_retries(Instant::now()) {
                if !self.dispatch(tasks, entry, shutdown).await? {
                    return Ok(());
                }
            }

            if let (Some(at), Some(timeout)) = (next_claim, cfg.claim_timeout) {
                if Instant::now() >= at {
                    if !self.reclaim(tasks, shutdown, timeout).await? {
                        return Ok(());
                    }
                    next_claim = Some(Instant::now() + timeout);
                }
            }

            let free = self.permits.available_permits();
            if free == 0 {
                tokio::select! {
                    Some(joined) = tasks.join_next() => log_join(joined),
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let block = self.next_block(next_claim);
            let read = self.transport.read_group(
                &cfg.channels,
                &cfg.group,
                &cfg.consumer,
                ReadCursor::New,
                free.min(cfg.batch_size.max(1)),
                block,
            );
            let batch = tokio::select! {
                batch = read => batch?,
                _ = shutdown.changed() => continue,
            };
            *failures = 0;

            for entry in batch {
                if self.admit(&entry) && !self.dispatch(tasks, entry, shutdown).await? {
                    return Ok(());
                }
            }
        }
    }

    /// Mark an entry as held by this consumer. Returns `false` if it already is.
    fn admit(&self, entry: &StreamEntry) -> bool {
        self.held.lock().insert(entry.key())
    }

    fn release(&self, entry: &StreamEntry) {
        self.held.lock().remove(&entry.key());
    }

    fn take_due_retries(&self, now: Instant) -> Vec<StreamEntry> {
        let mut retries = self.retries.lock();
        let (due, waiting): (Vec<_>, Vec<_>) = retries.drain(..).partition(|(at, _)| *at <= now);
        *retries = waiting;
        due.into_iter().map(|(_, entry)| entry).collect()
    }

    fn next_block(&self, next_claim: Option<Instant>) -> Duration {
        let now = Instant::now();
        let mut block = self.config.block;
        if let Some(at) = self.retries.lock().iter().map(|(at, _)| *at).min() {
            block = block.min(at.saturating_duration_since(now));
        }
        if let Some(at) = next_claim {
            block = block.min(at.saturating_duration_since(now));
        }
        block
    }

    async fn reclaim(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        shutdown: &mut watch::Receiver<bool>,
        min_idle: Duration,
    ) -> TransportResult<bool> {
        let cfg = &self.config;
        for channel in &cfg.channels {
            let claimed = self
                .transport
                .claim_stale(
                    channel,
                    &cfg.group,
                    &cfg.consumer,
                    min_idle,
                    cfg.batch_size.max(1) * 10,
                )
                .await?;
            for entry in claimed {
                if !self.admit(&entry) {
                    continue;
                }
                info!(
                    channel = %entry.channel,
                    id = %entry.id,
                    deliveries = entry.delivery_count,
                    "Reclaimed entry abandoned by another consumer"
                );
                if !self.dispatch(tasks, entry, shutdown).await? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn acquire(&self, shutdown: &mut watch::Receiver<bool>) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            _ = shutdown.changed() => None,
        }
    }

    /// Start handling a held entry. Returns `false` if shutdown was requested
    /// while waiting for a free slot.
    async fn dispatch(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        entry: StreamEntry,
        shutdown: &mut watch::Receiver<bool>,
    ) -> TransportResult<bool> {
        if let Some(max) = self.config.max_deliveries {
            if entry.delivery_count > max {
                self.dead_letter(&entry).await?;
                self.release(&entry);
                return Ok(true);
            }
        }

        let Some(permit) = self.acquire(shutdown).await else {
            return Ok(false);
        };

        debug!(
            channel = %entry.channel,
            id = %entry.id,
            deliveries = entry.delivery_count,
            "Dispatching entry"
        );

        let shared = Arc::clone(self);
        tasks.spawn(async move {
            let _permit = permit;
            let outcome = AssertUnwindSafe(shared.handler.handle(&entry))
                .catch_unwind()
                .await;
            let disposition = match outcome {
                Ok(disposition) => disposition,
                Err(_) => {
                    error!(channel = %entry.channel, id = %entry.id, "Entry handler panicked");
                    Disposition::Retry
                }
            };
            shared.settle(entry, disposition).await;
        });
        Ok(true)
    }

    async fn settle(&self, mut entry: StreamEntry, disposition: Disposition) {
        let cfg = &self.config;
        match disposition {
            Disposition::Ack => {
                if let Err(e) = self.transport.ack(&entry.channel, &cfg.group, entry.id).await {
                    warn!(
                        channel = %entry.channel,
                        id = %entry.id,
                        error = %e,
                        "Failed to acknowledge entry, it will be delivered again"
                    );
                }
                self.release(&entry);
            }
            Disposition::Retry => {
                if cfg.max_deliveries.is_some_and(|max| entry.delivery_count >= max) {
                    if let Err(e) = self.dead_letter(&entry).await {
                        warn!(
                            channel = %entry.channel,
                            id = %entry.id,
                            error = %e,
                            "Failed to dead-letter entry"
                        );
                    }
                    self.release(&entry);
                    return;
                }
                // Reset the idle time so group members do not claim an entry
                // this consumer is still retrying.
                let touched = self
                    .transport
                    .touch(&entry.channel, &cfg.group, &cfg.consumer, entry.id)
                    .await;
                match touched {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(
                            channel = %entry.channel,
                            id = %entry.id,
                            "Entry taken over by another consumer, not retrying"
                        );
                        self.release(&entry);
                        return;
                    }
                    Err(e) => {
                        debug!(
                            channel = %entry.channel,
                            id = %entry.id,
                            error = %e,
                            "Cannot touch entry"
                        );
                    }
                }
                debug!(
                    channel = %entry.channel,
                    id = %entry.id,
                    retry_in_ms = cfg.retry_delay.as_millis() as u64,
                    "Entry left pending for retry"
                );
                entry.delivery_count += 1;
                self.retries
                    .lock()
                    .push((Instant::now() + cfg.retry_delay, entry));
            }
        }
    }

    async fn dead_letter(&self, entry: &StreamEntry) -> TransportResult<()> {
        let dead = dead_letter_channel(&entry.channel);
        self.transport.publish(&dead, &entry.payload).await?;
        self.transport
            .ack(&entry.channel, &self.config.group, entry.id)
            .await?;
        metric_inc!(DEAD_LETTERED, &[entry.channel.as_str()]);
        warn!(
            channel = %entry.channel,
            id = %entry.id,
            deliveries = entry.delivery_count,
            dead_letter = %dead,
            "Entry exceeded delivery limit and was dead-lettered"
        );
        Ok(())
    }
}
