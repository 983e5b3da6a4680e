use thiserror::Error;

/// Errors surfaced by the coalescer to its callers.
///
/// Handler failures and stale timers never show up here: those are absorbed
/// and logged inside the batcher.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatcherError {
    /// The ingress layer handed over an envelope without a sender.
    #[error("envelope `{message_id}` has no sender_id")]
    MissingSenderId { message_id: String },

    /// A configuration value could not be parsed or is out of range.
    #[error("invalid config value for `{key}`: {reason}")]
    InvalidConfig { key: String, reason: String },
}

impl BatcherError {
    pub fn invalid_config(key: &str, reason: impl Into<String>) -> Self {
        BatcherError::InvalidConfig {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
