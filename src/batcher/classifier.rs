use envelope::Envelope;

use crate::config::BatcherConfig;

/// Decides which messages must skip batching: button presses (payload),
/// media (attachments) and texts carrying an urgency keyword.
#[derive(Debug, Clone, Default)]
pub struct ImmediateDispatch {
    keywords: Vec<String>,
}

impl ImmediateDispatch {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &BatcherConfig) -> Self {
        Self::new(&config.urgent_keywords)
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn is_immediate(&self, envelope: &Envelope) -> bool {
        envelope.payload.is_some()
            || envelope.attachments.is_some()
            || envelope
                .text
                .as_deref()
                .is_some_and(|text| self.matched_keyword(text).is_some())
    }

    /// First configured keyword contained in `text`, ignoring case.
    pub fn matched_keyword(&self, text: &str) -> Option<&str> {
        let lowered = text.to_lowercase();
        self.keywords
            .iter()
            .find(|k| lowered.contains(k.as_str()))
            .map(String::as_str)
    }
}
