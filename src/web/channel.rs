//! In-process web channel.
//!
//! Bridges the browser to the same pipeline as every other channel: inbound
//! messages are injected by the HTTP handler, outbound messages and typing
//! indicators become SSE events for all subscribers of the conversation.

use super::sse::SseManager;
use async_trait::async_trait;
use std::sync::RwLock;
use switchboard_core::error::HostError;
use switchboard_core::message::{NormalizedMessage, OutgoingMessage};
use switchboard_core::traits::{
    Channel, ChannelInfo, ChannelKind, ChannelStatus, MessageHandler,
};
use uuid::Uuid;

const WEB_SENDER_ID: &str = "web-user";

pub struct WebChannel {
    id: String,
    sse: SseManager,
    handler: RwLock<Option<MessageHandler>>,
    status: RwLock<ChannelStatus>,
}

impl WebChannel {
    pub fn new(id: &str, sse: SseManager) -> Self {
        Self {
            id: id.to_string(),
            sse,
            handler: RwLock::new(None),
            status: RwLock::new(ChannelStatus::Disconnected),
        }
    }

    /// Inject a browser message into the pipeline. Mints a conversation id
    /// when absent, invokes the shared handler WITHOUT awaiting, and returns
    /// ids immediately so the browser can open its SSE stream.
    pub fn inject_message(
        &self,
        text: &str,
        conversation_id: Option<String>,
    ) -> (String, Uuid) {
        let conversation_id =
            conversation_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let message = NormalizedMessage::new(&self.id, &conversation_id, WEB_SENDER_ID, text);
        let message_id = message.id;

        let handler = self
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            tokio::spawn(handler(message));
        }

        (conversation_id, message_id)
    }
}

#[async_trait]
impl Channel for WebChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Web
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    async fn connect(&self) -> Result<(), HostError> {
        // In-process transport: nothing to dial.
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = ChannelStatus::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), HostError> {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = ChannelStatus::Disconnected;
        Ok(())
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        message: OutgoingMessage,
    ) -> Result<(), HostError> {
        self.sse
            .send(
                conversation_id,
                "message",
                serde_json::json!({
                    "text": message.text,
                    "conversationId": conversation_id,
                    "timestamp": chrono::Utc::now().timestamp_millis(),
                }),
            )
            .await;
        Ok(())
    }

    async fn send_typing(&self, conversation_id: &str) -> Result<(), HostError> {
        self.sse
            .send(
                conversation_id,
                "typing",
                serde_json::json!({"conversationId": conversation_id}),
            )
            .await;
        Ok(())
    }

    async fn status(&self) -> ChannelInfo {
        ChannelInfo {
            id: self.id.clone(),
            kind: ChannelKind::Web,
            status: *self.status.read().unwrap_or_else(|e| e.into_inner()),
            error: None,
        }
    }
}
