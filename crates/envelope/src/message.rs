use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display};

/// One inbound message as handed over by the ingress layer
/// (Instagram / WhatsApp decoding happens before this point).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Envelope {
    pub sender_id: String,               // Platform user id, the batching key
    pub message_id: String,              // Platform message id (or generated)
    pub timestamp: DateTime<Utc>,        // When the platform received it
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,         // Quick-reply / postback payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    QuickReply,
    Attachment,
    Postback,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,                    // image, video, audio, file, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,          // Raw platform-specific data
}

impl Envelope {
    /// Builds an envelope with a generated message id and the current time.
    pub fn new(sender_id: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            sender_id: sender_id.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            text: None,
            payload: None,
            attachments: None,
        }
    }

    pub fn text(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(sender_id, MessageKind::Text).with_text(text)
    }

    pub fn quick_reply(
        sender_id: impl Into<String>,
        text: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(sender_id, MessageKind::QuickReply)
            .with_text(text)
            .with_payload(payload)
    }

    pub fn postback(sender_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(sender_id, MessageKind::Postback).with_payload(payload)
    }

    pub fn attachment(sender_id: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self::new(sender_id, MessageKind::Attachment).with_attachments(attachments)
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    /// Text exactly as sent; `None` when absent or empty.
    pub fn non_empty_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.is_empty())
    }
}

impl Attachment {
    pub fn new(kind: impl Into<String>, url: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            url,
            payload: None,
        }
    }
}
