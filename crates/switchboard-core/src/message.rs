use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A normalised inbound message from a channel.
///
/// Immutable after creation; the pipeline never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// Globally unique message id.
    pub id: Uuid,
    /// Channel id (e.g. "telegram", "web").
    pub channel_id: String,
    /// Platform-scoped conversation id.
    pub conversation_id: String,
    /// Platform-specific sender id.
    pub sender_id: String,
    /// Human-readable sender name.
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Message text content.
    pub text: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Opaque platform message id, echoed back for reply-to.
    #[serde(default)]
    pub platform_message_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl NormalizedMessage {
    /// Build a message with a fresh id and the current timestamp.
    pub fn new(channel_id: &str, conversation_id: &str, sender_id: &str, text: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id: channel_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: None,
            text: text.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            platform_message_id: None,
            attachments: Vec::new(),
        }
    }

    /// The serialisation key for per-conversation state: `<channel>:<conversation>`.
    pub fn conversation_key(&self) -> String {
        format!("{}:{}", self.channel_id, self.conversation_id)
    }
}

/// An outgoing message to send back through a channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub text: String,
    /// Platform message id to reply to, if the platform supports threading.
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_to_message_id: None,
            attachments: Vec::new(),
        }
    }

    pub fn reply(text: impl Into<String>, reply_to: Option<String>) -> Self {
        Self {
            text: text.into(),
            reply_to_message_id: reply_to,
            attachments: Vec::new(),
        }
    }
}

/// A file attachment on a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub file_type: AttachmentType,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

/// Supported attachment types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentType {
    Image,
    Document,
    Audio,
    Video,
    Other,
}

/// A DateTime rendered as ISO-8601 for persisted records.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339()
}

/// Parse an ISO-8601 timestamp back into a DateTime.
pub fn parse_iso(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
