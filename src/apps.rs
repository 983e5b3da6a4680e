// src/apps.rs
use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use envelope::Envelope;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};

use crate::{
    batcher::{DispatchHandler, MessageBatcher},
    config::{BatcherConfig, ConfigManager},
    error::BatcherError,
};

/// Command-line values that take precedence over the config manager.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub batch_timeout_secs: Option<f64>,
    pub max_batch_size: Option<usize>,
    pub cleanup_interval_secs: Option<f64>,
    pub urgent_keywords: Option<Vec<String>>,
}

impl ConfigOverrides {
    pub fn apply(self, mut config: BatcherConfig) -> Result<BatcherConfig, BatcherError> {
        if let Some(secs) = self.batch_timeout_secs {
            config.batch_timeout = Duration::try_from_secs_f64(secs)
                .map_err(|e| BatcherError::invalid_config("batch-timeout", e.to_string()))?;
        }
        if let Some(size) = self.max_batch_size {
            config.max_batch_size = size;
        }
        if let Some(secs) = self.cleanup_interval_secs {
            config.cleanup_interval = Duration::try_from_secs_f64(secs)
                .map_err(|e| BatcherError::invalid_config("cleanup-interval", e.to_string()))?;
        }
        if let Some(keywords) = self.urgent_keywords {
            config.urgent_keywords = keywords;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Counts from one ingress session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngressReport {
    pub received: usize,
    pub batched: usize,
    pub immediate: usize,
    pub rejected: usize,
}

/// Composition root: owns the one batcher of the process and ties its
/// lifecycle to the host's start and stop hooks.
pub struct App {
    batcher: MessageBatcher,
}

impl App {
    pub fn new(config: BatcherConfig) -> Result<Self, BatcherError> {
        Ok(Self {
            batcher: MessageBatcher::new(config)?,
        })
    }

    /// Load config from `config`, overlay `overrides` and build the app.
    pub async fn bootstrap(config: &ConfigManager, overrides: ConfigOverrides) -> Result<Self> {
        let loaded = BatcherConfig::load(config).await?;
        let batcher_config = overrides.apply(loaded)?;
        info!(config = ?batcher_config, "batcher configuration resolved");
        Ok(Self::new(batcher_config)?)
    }

    pub fn with_handler(self, handler: Arc<dyn DispatchHandler>) -> Self {
        self.batcher.add_handler(handler);
        self
    }

    pub fn batcher(&self) -> &MessageBatcher {
        &self.batcher
    }

    pub fn start(&self) {
        self.batcher.start();
    }

    /// Feed newline-delimited JSON envelopes into the batcher until the input
    /// ends or `stop` resolves. Bad lines are logged and skipped.
    pub async fn serve_lines<R, S>(&self, reader: R, stop: S) -> Result<IngressReport>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ()>,
    {
        let mut report = IngressReport::default();
        let mut lines = reader.lines();
        tokio::pin!(stop);

        loop {
            let line = tokio::select! {
                _ = &mut stop => {
                    info!("stop requested, leaving ingress loop");
                    break;
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                info!("ingress reached end of input");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            report.received += 1;
            let envelope: Envelope = match serde_json::from_str(&line) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(error = %err, "skipping malformed envelope line");
                    report.rejected += 1;
                    continue;
                }
            };

            match self.batcher.process_message(envelope).await {
                Ok(true) => report.batched += 1,
                Ok(false) => report.immediate += 1,
                Err(err) => {
                    error!(error = %err, "rejected envelope");
                    report.rejected += 1;
                }
            }
        }

        Ok(report)
    }

    pub async fn shutdown(&self) {
        self.batcher.shutdown().await;
    }
}
