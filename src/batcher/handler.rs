use anyhow::{Context, Result};
use async_trait::async_trait;
use envelope::Envelope;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tracing::info;

use super::batch::BatchInfo;

/// A downstream consumer of finished turns (the assistant, an audit sink, ...).
///
/// Handlers are called one after another for every flush. An `Err` or a panic
/// is logged by the batcher and does not stop the remaining handlers.
///
/// `handle` runs while the batcher holds the user's lock. Calling
/// `process_message` or `force_process_user_batch` for that same user from
/// inside a handler deadlocks; hand the work off to another task instead.
#[async_trait]
pub trait DispatchHandler: Send + Sync {
    /// Used in logs and metrics to identify the handler.
    fn name(&self) -> &str;

    async fn handle(&self, envelope: Envelope, info: BatchInfo) -> Result<()>;
}

/// One delivered turn, as written by [`JsonLinesHandler`] and forwarded by
/// [`ChannelHandler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Dispatch {
    pub envelope: Envelope,
    pub info: BatchInfo,
}

/// Logs every dispatched turn.
#[derive(Debug, Clone, Default)]
pub struct LoggingHandler;

#[async_trait]
impl DispatchHandler for LoggingHandler {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, envelope: Envelope, info: BatchInfo) -> Result<()> {
        info!(
            user_id = %envelope.sender_id,
            message_id = %envelope.message_id,
            batched = info.is_batched,
            messages = info.message_count,
            duration_s = info.batch_duration_seconds,
            "turn dispatched"
        );
        Ok(())
    }
}

/// Writes each turn as one JSON line to an async writer (stdout in the binary).
pub struct JsonLinesHandler<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesHandler<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> DispatchHandler for JsonLinesHandler<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn name(&self) -> &str {
        "json_lines"
    }

    async fn handle(&self, envelope: Envelope, info: BatchInfo) -> Result<()> {
        let mut line = serde_json::to_vec(&Dispatch { envelope, info })?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await.context("writing dispatch line")?;
        writer.flush().await?;
        Ok(())
    }
}

/// Forwards turns into an mpsc channel, for embedding the batcher in a larger
/// pipeline.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    name: String,
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl ChannelHandler {
    pub fn new(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Dispatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl DispatchHandler for ChannelHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, envelope: Envelope, info: BatchInfo) -> Result<()> {
        self.tx
            .send(Dispatch { envelope, info })
            .map_err(|_| anyhow::anyhow!("receiver for `{}` was dropped", self.name))
    }
}
