use crate::{
    error::HostError,
    message::{NormalizedMessage, OutgoingMessage},
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The single process-wide inbound handler shared by every channel.
///
/// Channels invoke it by spawning the returned future; inbound handling is
/// fire-and-forget from the transport's point of view.
pub type MessageHandler =
    Arc<dyn Fn(NormalizedMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Channel type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Telegram,
    Whatsapp,
    Wechat,
    Imessage,
    Web,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Whatsapp => "whatsapp",
            Self::Wechat => "wechat",
            Self::Imessage => "imessage",
            Self::Web => "web",
        }
    }
}

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// A channel's identity and current status, as reported to health consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    pub status: ChannelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Messaging channel trait: a pluggable transport adapter.
///
/// Every platform (Telegram, the in-process web channel, etc.) implements this
/// trait to receive and send messages behind a uniform contract.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable channel identity.
    fn id(&self) -> &str;

    /// Channel type tag.
    fn kind(&self) -> ChannelKind;

    /// Register the shared inbound handler. Called exactly once at startup,
    /// before `connect`.
    fn on_message(&self, handler: MessageHandler);

    /// Start the transport. Moves status through `connecting → connected`,
    /// or `→ error` with a reason; failures are surfaced via `status()`
    /// rather than panicking the caller.
    async fn connect(&self) -> Result<(), HostError>;

    /// Graceful shutdown.
    async fn disconnect(&self) -> Result<(), HostError>;

    /// Send a message into a conversation on this channel.
    async fn send_message(
        &self,
        conversation_id: &str,
        message: OutgoingMessage,
    ) -> Result<(), HostError>;

    /// Show a typing indicator. Platforms without one ignore this.
    async fn send_typing(&self, _conversation_id: &str) -> Result<(), HostError> {
        Ok(())
    }

    /// Identity plus current connection status.
    async fn status(&self) -> ChannelInfo;
}
