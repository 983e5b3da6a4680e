use std::sync::Arc;

use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, info, trace};

use super::{FlushReason, manager::MessageBatcher};

/// One-shot timer for a freshly opened batch. It only flushes the batch it was
/// scheduled for: if that instance is already gone when the timer fires, the
/// timer does nothing.
pub(super) fn schedule_flush(batcher: &MessageBatcher, user_id: String, sequence: u64) {
    let timeout = batcher.inner.config.batch_timeout;
    let cancel = batcher.inner.cancel.clone();
    let owner = batcher.clone();

    batcher.inner.tasks.spawn(async move {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!(user_id = %user_id, sequence, "flush timer cancelled");
            }
            _ = sleep(timeout) => {
                owner.flush_if_current(&user_id, sequence, FlushReason::Timeout).await;
            }
        }
    });
}

/// Periodic scan for expired batches whose timer never ran. Holds only a weak
/// reference so a dropped batcher ends the loop.
pub(super) fn spawn_sweeper(batcher: &MessageBatcher) {
    let period = batcher.inner.config.cleanup_interval;
    let cancel = batcher.inner.cancel.clone();
    let weak = Arc::downgrade(&batcher.inner);

    batcher.inner.tasks.spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(inner) = weak.upgrade() else {
                break;
            };
            let flushed = MessageBatcher::from_inner(inner).sweep_expired().await;
            if flushed > 0 {
                info!(flushed, "sweeper flushed expired batches");
            }
        }
        debug!("cleanup sweeper stopped");
    });
}
