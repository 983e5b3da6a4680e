use std::time::Duration;

use chrono::{DateTime, Utc};
use envelope::{Envelope, MessageKind};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// What handlers learn about the turn they receive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchInfo {
    pub is_batched: bool,
    pub message_count: usize,
    pub batch_duration_seconds: f64,
}

impl BatchInfo {
    /// Info for a message that bypassed batching.
    pub fn single() -> Self {
        Self {
            is_batched: false,
            message_count: 1,
            batch_duration_seconds: 0.0,
        }
    }
}

/// A user's pending turn: every message received since the batch opened, in
/// arrival order.
#[derive(Debug, Clone)]
pub struct Batch {
    user_id: String,
    sequence: u64,
    messages: Vec<Envelope>,
    created_at: Instant,
    started_at: DateTime<Utc>,
    timeout: Duration,
}

impl Batch {
    pub fn new(user_id: impl Into<String>, sequence: u64, first: Envelope, timeout: Duration) -> Self {
        Self {
            user_id: user_id.into(),
            sequence,
            messages: vec![first],
            created_at: Instant::now(),
            started_at: Utc::now(),
            timeout,
        }
    }

    pub fn add(&mut self, envelope: Envelope) {
        self.messages.push(envelope);
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Identity of this batch instance; never reused by the same batcher.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn messages(&self) -> &[Envelope] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.age() > self.timeout
    }

    pub fn is_full(&self, max_batch_size: usize) -> bool {
        self.len() >= max_batch_size
    }

    /// Texts joined with a single space, skipping messages without text.
    /// Each text is kept verbatim, whitespace included.
    pub fn combined_text(&self) -> String {
        self.messages
            .iter()
            .filter_map(Envelope::non_empty_text)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn info(&self) -> BatchInfo {
        BatchInfo {
            is_batched: true,
            message_count: self.len(),
            batch_duration_seconds: self.age().as_secs_f64(),
        }
    }

    /// One envelope standing in for the whole turn. Payload and attachments
    /// come from the most recent message rather than being merged.
    pub fn synthesize_dispatch_envelope(&self) -> Envelope {
        let latest = self.messages.last();
        let text = self.combined_text();

        Envelope {
            sender_id: self.user_id.clone(),
            message_id: format!("batch_{}", uuid::Uuid::new_v4()),
            timestamp: Utc::now(),
            kind: MessageKind::Text,
            text: (!text.is_empty()).then_some(text),
            payload: latest.and_then(|m| m.payload.clone()),
            attachments: latest.and_then(|m| m.attachments.clone()),
        }
    }
}
