// src/batcher/manager.rs

use std::{
    any::Any,
    collections::BTreeSet,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use envelope::Envelope;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use super::{
    FlushReason,
    batch::{Batch, BatchInfo},
    classifier::ImmediateDispatch,
    handler::DispatchHandler,
    scheduler,
};
use crate::{config::BatcherConfig, error::BatcherError, logger::BatcherMetrics};

/// Coalesces inbound messages per user and hands finished turns to the
/// registered handlers.
///
/// Cloning is cheap; all clones share the same state. Every state transition
/// for a user happens while holding that user's lock, so messages of one user
/// are handled strictly in arrival order while different users never wait on
/// each other.
#[derive(Clone)]
pub struct MessageBatcher {
    pub(super) inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) config: BatcherConfig,
    classifier: ImmediateDispatch,
    batches: DashMap<String, Batch>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    handlers: StdMutex<Vec<Arc<dyn DispatchHandler>>>,
    next_sequence: AtomicU64,
    pub(super) cancel: CancellationToken,
    pub(super) tasks: TaskTracker,
    sweeper_started: AtomicBool,
    shut_down: AtomicBool,
    metrics: BatcherMetrics,
}

/// Read-only snapshot for health and ops tooling.
#[derive(Debug, Clone, Serialize)]
pub struct BatcherStats {
    pub active_batches: usize,
    pub tracked_locks: usize,
    pub handlers: usize,
    pub shut_down: bool,
    pub batches: Vec<BatchStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    pub user_id: String,
    pub sequence: u64,
    pub message_count: usize,
    pub age_seconds: f64,
    pub expired: bool,
    pub started_at: DateTime<Utc>,
}

impl MessageBatcher {
    /// Build a batcher from `config`, rejecting values the timers and the
    /// sweeper cannot run with.
    pub fn new(config: BatcherConfig) -> Result<Self, BatcherError> {
        config.validate()?;
        let classifier = ImmediateDispatch::from_config(&config);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                classifier,
                batches: DashMap::new(),
                locks: DashMap::new(),
                handlers: StdMutex::new(Vec::new()),
                next_sequence: AtomicU64::new(1),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                sweeper_started: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                metrics: BatcherMetrics::new(),
            }),
        })
    }

    pub(super) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.inner.config
    }

    /// Register a consumer for every flushed batch and immediate message.
    pub fn add_handler(&self, handler: Arc<dyn DispatchHandler>) {
        info!(handler = handler.name(), "dispatch handler registered");
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Spawn the cleanup sweeper. Calling it again is a no-op.
    pub fn start(&self) {
        if self.is_shut_down() {
            warn!("batcher already shut down, not starting sweeper");
            return;
        }
        if self.inner.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        scheduler::spawn_sweeper(self);
        info!(
            batch_timeout_s = self.inner.config.batch_timeout.as_secs_f64(),
            max_batch_size = self.inner.config.max_batch_size,
            cleanup_interval_s = self.inner.config.cleanup_interval.as_secs_f64(),
            "message batcher started"
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Feed one inbound message.
    ///
    /// Returns `Ok(true)` when the message joined a batch and `Ok(false)` when
    /// it was dispatched on its own right away.
    pub async fn process_message(&self, envelope: Envelope) -> Result<bool, BatcherError> {
        if envelope.sender_id.trim().is_empty() {
            return Err(BatcherError::MissingSenderId {
                message_id: envelope.message_id,
            });
        }

        let user_id = envelope.sender_id.clone();
        let lock = self.lock_for(&user_id);
        let queued = {
            let _guard = lock.lock().await;
            self.process_locked(envelope).await
        };
        drop(lock);
        self.release_lock(&user_id);
        Ok(queued)
    }

    async fn process_locked(&self, envelope: Envelope) -> bool {
        let user_id = envelope.sender_id.clone();

        if self.is_shut_down() {
            warn!(user_id = %user_id, "message after shutdown, dispatching without batching");
            self.dispatch_single(envelope).await;
            return false;
        }

        if self.inner.classifier.is_immediate(&envelope) {
            if let Some((_, pending)) = self.inner.batches.remove(&user_id) {
                self.flush_batch(pending, FlushReason::Preempted).await;
            }
            self.dispatch_single(envelope).await;
            return false;
        }

        let max = self.inner.config.max_batch_size;
        let stale = match self.inner.batches.get_mut(&user_id) {
            Some(mut batch) if !batch.is_expired() && !batch.is_full(max) => {
                batch.add(envelope);
                self.inner.metrics.message_batched();
                debug!(
                    user_id = %user_id,
                    sequence = batch.sequence(),
                    size = batch.len(),
                    "message appended to batch"
                );
                return true;
            }
            Some(batch) if batch.is_expired() => Some(FlushReason::Expired),
            Some(_) => Some(FlushReason::BatchFull),
            None => None,
        };

        if let Some(reason) = stale {
            if let Some((_, pending)) = self.inner.batches.remove(&user_id) {
                self.flush_batch(pending, reason).await;
            }
        }

        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        let batch = Batch::new(user_id.clone(), sequence, envelope, self.inner.config.batch_timeout);
        self.inner.batches.insert(user_id.clone(), batch);
        self.inner.metrics.message_batched();
        scheduler::schedule_flush(self, user_id.clone(), sequence);
        debug!(user_id = %user_id, sequence, "batch opened");
        true
    }

    /// Flush a user's pending batch right now. Returns `false` when the user
    /// has nothing pending.
    pub async fn force_process_user_batch(&self, user_id: &str) -> bool {
        let lock = self.lock_for(user_id);
        let flushed = {
            let _guard = lock.lock().await;
            match self.inner.batches.remove(user_id) {
                Some((_, batch)) => {
                    self.flush_batch(batch, FlushReason::Forced).await;
                    true
                }
                None => false,
            }
        };
        drop(lock);
        self.release_lock(user_id);
        flushed
    }

    /// Flush `user_id`'s batch only if it is still the instance `sequence`
    /// refers to. A timer that lost the race to another flush path ends here.
    pub(super) async fn flush_if_current(&self, user_id: &str, sequence: u64, reason: FlushReason) -> bool {
        let lock = self.lock_for(user_id);
        let flushed = {
            let _guard = lock.lock().await;
            let current = self
                .inner
                .batches
                .remove_if(user_id, |_, batch| batch.sequence() == sequence);
            match current {
                Some((_, batch)) => {
                    self.flush_batch(batch, reason).await;
                    true
                }
                None => {
                    trace!(user_id = %user_id, sequence, "batch already flushed, timer ignored");
                    false
                }
            }
        };
        drop(lock);
        self.release_lock(user_id);
        flushed
    }

    /// Flush every expired batch. Returns how many were flushed.
    pub(super) async fn sweep_expired(&self) -> usize {
        let expired: Vec<(String, u64)> = self
            .inner
            .batches
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| (entry.key().clone(), entry.value().sequence()))
            .collect();

        let mut flushed = 0;
        for (user_id, sequence) in expired {
            if self.flush_if_current(&user_id, sequence, FlushReason::Sweep).await {
                flushed += 1;
            }
        }
        flushed
    }

    /// Stop the sweeper and all timers, then flush every pending batch.
    ///
    /// Messages that arrive afterwards are dispatched one by one. When this
    /// returns no timer or sweeper task is running any more.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!("batcher shutdown already requested");
            return;
        }
        info!(active_batches = self.inner.batches.len(), "message batcher shutting down");
        self.inner.cancel.cancel();

        // Users with a lock entry may be mid-way through process_message and
        // about to open a batch; waiting on their lock catches those too.
        let mut users: BTreeSet<String> = self
            .inner
            .locks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        users.extend(self.inner.batches.iter().map(|entry| entry.key().clone()));

        let mut drained = 0;
        for user_id in users {
            let lock = self.lock_for(&user_id);
            {
                let _guard = lock.lock().await;
                if let Some((_, batch)) = self.inner.batches.remove(&user_id) {
                    self.flush_batch(batch, FlushReason::Shutdown).await;
                    drained += 1;
                }
            }
            drop(lock);
            self.release_lock(&user_id);
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        if !self.inner.batches.is_empty() {
            error!(remaining = self.inner.batches.len(), "batches left after drain");
        }
        info!(drained, "message batcher stopped");
    }

    pub fn stats(&self) -> BatcherStats {
        let mut batches: Vec<BatchStats> = self
            .inner
            .batches
            .iter()
            .map(|entry| {
                let batch = entry.value();
                BatchStats {
                    user_id: entry.key().clone(),
                    sequence: batch.sequence(),
                    message_count: batch.len(),
                    age_seconds: batch.age().as_secs_f64(),
                    expired: batch.is_expired(),
                    started_at: batch.started_at(),
                }
            })
            .collect();
        batches.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        BatcherStats {
            active_batches: batches.len(),
            tracked_locks: self.inner.locks.len(),
            handlers: self.handlers().len(),
            shut_down: self.is_shut_down(),
            batches,
        }
    }

    fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.inner.locks.get(user_id) {
            return lock.value().clone();
        }
        self.inner
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop the user's lock entry once nothing is pending and nobody else
    /// holds a reference. Clones only happen under the map's shard lock, so
    /// the count cannot grow while `remove_if` inspects it.
    fn release_lock(&self, user_id: &str) {
        self.inner.locks.remove_if(user_id, |_, lock| {
            Arc::strong_count(lock) == 1 && !self.inner.batches.contains_key(user_id)
        });
    }

    fn handlers(&self) -> Vec<Arc<dyn DispatchHandler>> {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn flush_batch(&self, batch: Batch, reason: FlushReason) {
        let info = batch.info();
        let envelope = batch.synthesize_dispatch_envelope();
        debug!(
            user_id = %batch.user_id(),
            sequence = batch.sequence(),
            messages = info.message_count,
            reason = %reason,
            "flushing batch"
        );
        self.inner.metrics.batch_flushed(reason, info.message_count);
        self.dispatch(envelope, info, reason).await;
    }

    async fn dispatch_single(&self, envelope: Envelope) {
        self.inner.metrics.immediate_dispatch();
        debug!(user_id = %envelope.sender_id, kind = %envelope.kind, "immediate dispatch");
        self.dispatch(envelope, BatchInfo::single(), FlushReason::Immediate).await;
    }

    /// Hand the turn to each handler inside its own error and panic boundary.
    async fn dispatch(&self, envelope: Envelope, info: BatchInfo, reason: FlushReason) {
        let handlers = self.handlers();
        if handlers.is_empty() {
            warn!(
                user_id = %envelope.sender_id,
                reason = %reason,
                "no dispatch handler registered, turn not delivered"
            );
            return;
        }

        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle(envelope.clone(), info))
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            self.inner.metrics.handler_failed(handler.name());
            error!(
                handler = handler.name(),
                user_id = %envelope.sender_id,
                reason = %reason,
                error = %failure,
                "dispatch handler failed"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic>"
    }
}

impl fmt::Debug for MessageBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBatcher")
            .field("config", &self.inner.config)
            .field("active_batches", &self.inner.batches.len())
            .field("tracked_locks", &self.inner.locks.len())
            .field("handler_count", &self.handlers().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
