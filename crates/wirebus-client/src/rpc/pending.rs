//! Pending call store.
//!
//! Maps call ids to callers waiting for a result. The result loop completes
//! entries; callers that give up remove their own entry, and a periodic
//! sweep removes anything left behind.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};
use wirebus_telemetry::PENDING_CALLS;
use wirebus_types::{MessageId, ResultMessage};

/// A call waiting for its result.
struct PendingCall {
    sender: oneshot::Sender<ResultMessage>,
    created_at: Instant,
    /// `api.procedure`, for logging.
    method: String,
    timeout: Duration,
}

/// Counters for the pending call store.
#[derive(Debug, Default)]
pub struct PendingStats {
    pub total_registered: AtomicU64,
    pub total_completed: AtomicU64,
    pub total_timeouts: AtomicU64,
    /// Callers that went away before their result arrived.
    pub total_cancelled: AtomicU64,
    /// Results that arrived after their caller stopped waiting.
    pub total_late: AtomicU64,
}

#[derive(Default)]
pub struct PendingCallStore {
    pending: DashMap<MessageId, PendingCall>,
    stats: Arc<PendingStats>,
}

impl PendingCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call before publishing it and get a receiver for its result.
    pub fn register(
        &self,
        call_id: MessageId,
        method: &str,
        timeout: Duration,
    ) -> oneshot::Receiver<ResultMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            call_id,
            PendingCall {
                sender: tx,
                created_at: Instant::now(),
                method: method.to_string(),
                timeout,
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        self.update_gauge();
        debug!(call_id = %call_id, method, "Registered pending call");
        rx
    }

    /// Hand a result to its waiting caller.
    ///
    /// Returns false if nobody is waiting for it any more.
    pub fn complete(&self, result: ResultMessage) -> bool {
        let call_id = result.call_id;
        let Some((_, pending)) = self.pending.remove(&call_id) else {
            self.stats.total_late.fetch_add(1, Ordering::Relaxed);
            warn!(call_id = %call_id, "Dropping result for unknown or expired call");
            return false;
        };
        self.update_gauge();

        let elapsed = pending.created_at.elapsed();
        match pending.sender.send(result) {
            Ok(()) => {
                self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    call_id = %call_id,
                    method = pending.method,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Completed pending call"
                );
                true
            }
            Err(_) => {
                self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(call_id = %call_id, method = pending.method, "Caller went away");
                false
            }
        }
    }

    /// Remove a call whose caller timed out.
    pub fn expire(&self, call_id: &MessageId) -> bool {
        let removed = self.pending.remove(call_id).is_some();
        if removed {
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
            self.update_gauge();
        }
        removed
    }

    /// Remove a call that will never be answered, e.g. because publishing it failed.
    pub fn cancel(&self, call_id: &MessageId) -> bool {
        let removed = self.pending.remove(call_id).is_some();
        if removed {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            self.update_gauge();
        }
        removed
    }

    /// Remove calls older than their timeout. Returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.pending.retain(|id, call| {
            let elapsed = now.duration_since(call.created_at);
            if elapsed > call.timeout {
                warn!(
                    call_id = %id,
                    method = call.method,
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = call.timeout.as_millis() as u64,
                    "Removing expired pending call"
                );
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            self.stats
                .total_timeouts
                .fetch_add(removed as u64, Ordering::Relaxed);
            self.update_gauge();
        }
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, call_id: &MessageId) -> bool {
        self.pending.contains_key(call_id)
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }

    fn update_gauge(&self) {
        PENDING_CALLS.set(self.pending.len() as f64);
    }
}

/// Periodically sweep expired calls until shutdown.
pub async fn cleanup_task(
    store: Arc<PendingCallStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cleanup_interval = tokio::time::interval(interval);
    cleanup_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cleanup_interval.tick() => {
                let removed = store.remove_expired();
                if removed > 0 {
                    debug!(removed, "Cleaned up expired pending calls");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
