//! Per-user message batching.
//!
//! Bursts of messages from one user are collected into a [`Batch`] and handed
//! to every registered [`DispatchHandler`] as a single turn once the batch
//! window closes, the batch fills up, or the batcher shuts down. Structural
//! inputs (quick replies, postbacks, media) and urgent texts skip batching.

pub mod batch;
pub mod classifier;
pub mod handler;
pub mod manager;
mod scheduler;

use serde::Serialize;
use strum_macros::{Display, IntoStaticStr};

pub use batch::{Batch, BatchInfo};
pub use classifier::ImmediateDispatch;
pub use handler::{ChannelHandler, Dispatch, DispatchHandler, JsonLinesHandler, LoggingHandler};
pub use manager::{BatchStats, BatcherStats, MessageBatcher};

/// Why a dispatch happened; shows up in logs and metric attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FlushReason {
    /// The batch's own timer fired.
    Timeout,
    /// The cleanup sweeper found the batch expired.
    Sweep,
    /// A new message arrived after the window had closed.
    Expired,
    /// A new message arrived while the batch was at its size cap.
    BatchFull,
    /// An immediate-dispatch message arrived and went out after the batch.
    Preempted,
    /// `force_process_user_batch` was called.
    Forced,
    /// Drained by `shutdown`.
    Shutdown,
    /// A single message that skipped batching.
    Immediate,
}
