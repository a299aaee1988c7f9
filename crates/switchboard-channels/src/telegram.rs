//! Telegram Bot API channel.
//!
//! Uses long polling via `getUpdates` and `sendMessage` for responses.
//! Docs: <https://core.telegram.org/bots/api>

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::error::HostError;
use switchboard_core::message::{NormalizedMessage, OutgoingMessage};
use switchboard_core::traits::{
    Channel, ChannelInfo, ChannelKind, ChannelStatus, MessageHandler,
};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Long-poll timeout passed to `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 25;

/// Telegram channel using the Bot API with long polling.
pub struct TelegramChannel {
    id: String,
    client: reqwest::Client,
    base_url: String,
    handler: std::sync::RwLock<Option<MessageHandler>>,
    state: RwLock<(ChannelStatus, Option<String>)>,
    /// Tracks the last update_id to avoid reprocessing.
    last_update_id: Arc<Mutex<Option<i64>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

// --- Bot API wire types ---

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<TgUser>,
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    date: i64,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

impl TelegramChannel {
    pub fn new(id: &str, token: &str) -> Self {
        Self {
            id: id.to_string(),
            client: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{token}"),
            handler: std::sync::RwLock::new(None),
            state: RwLock::new((ChannelStatus::Disconnected, None)),
            last_update_id: Arc::new(Mutex::new(None)),
            poll_task: Mutex::new(None),
        }
    }

    async fn set_state(&self, status: ChannelStatus, error: Option<String>) {
        *self.state.write().await = (status, error);
    }

    /// One long-poll cycle: fetch updates, normalise, hand to the shared
    /// handler (fire-and-forget per message).
    async fn poll_once(
        client: &reqwest::Client,
        base_url: &str,
        channel_id: &str,
        last_update_id: &Mutex<Option<i64>>,
        handler: &MessageHandler,
    ) -> Result<(), HostError> {
        let offset = last_update_id.lock().await.map(|id| id + 1);
        let mut query: Vec<(String, String)> =
            vec![("timeout".into(), POLL_TIMEOUT_SECS.to_string())];
        if let Some(offset) = offset {
            query.push(("offset".into(), offset.to_string()));
        }

        let resp = client
            .get(format!("{base_url}/getUpdates"))
            .query(&query)
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .send()
            .await
            .map_err(|e| HostError::Channel(format!("telegram getUpdates failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(HostError::Channel(format!(
                "telegram getUpdates returned {status}"
            )));
        }

        let parsed: UpdatesResponse = resp
            .json()
            .await
            .map_err(|e| HostError::Channel(format!("telegram: bad getUpdates body: {e}")))?;
        if !parsed.ok {
            return Err(HostError::Channel("telegram: getUpdates not ok".into()));
        }

        for update in parsed.result {
            {
                let mut last = last_update_id.lock().await;
                *last = Some(update.update_id);
            }
            let Some(message) = update.message else {
                continue;
            };
            let Some(text) = message.text else {
                debug!("telegram: skipping non-text message {}", message.message_id);
                continue;
            };
            let sender_name = message.from.as_ref().map(|u| {
                u.username
                    .clone()
                    .unwrap_or_else(|| u.first_name.clone())
            });
            let normalized = NormalizedMessage {
                id: Uuid::new_v4(),
                channel_id: channel_id.to_string(),
                conversation_id: message.chat.id.to_string(),
                sender_id: message
                    .from
                    .as_ref()
                    .map(|u| u.id.to_string())
                    .unwrap_or_default(),
                sender_name,
                text,
                timestamp: message.date * 1000,
                platform_message_id: Some(message.message_id.to_string()),
                attachments: Vec::new(),
            };
            tokio::spawn(handler(normalized));
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    async fn connect(&self) -> Result<(), HostError> {
        self.set_state(ChannelStatus::Connecting, None).await;

        // Probe the token before starting the poll loop.
        let resp = self
            .client
            .get(format!("{}/getMe", self.base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => {
                let reason = format!("telegram getMe returned {}", r.status());
                self.set_state(ChannelStatus::Error, Some(reason.clone()))
                    .await;
                return Err(HostError::Channel(reason));
            }
            Err(e) => {
                let reason = format!("telegram getMe failed: {e}");
                self.set_state(ChannelStatus::Error, Some(reason.clone()))
                    .await;
                return Err(HostError::Channel(reason));
            }
        }

        let handler = self
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(handler) = handler else {
            let reason = "telegram: no message handler registered".to_string();
            self.set_state(ChannelStatus::Error, Some(reason.clone()))
                .await;
            return Err(HostError::Channel(reason));
        };

        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let channel_id = self.id.clone();
        let last_update_id = self.last_update_id.clone();
        let task = tokio::spawn(async move {
            info!("telegram: polling started");
            loop {
                if let Err(e) =
                    Self::poll_once(&client, &base_url, &channel_id, &last_update_id, &handler)
                        .await
                {
                    warn!("telegram poll error: {e}");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        });

        let mut slot = self.poll_task.lock().await;
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
        drop(slot);

        self.set_state(ChannelStatus::Connected, None).await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), HostError> {
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
        }
        self.set_state(ChannelStatus::Disconnected, None).await;
        Ok(())
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        message: OutgoingMessage,
    ) -> Result<(), HostError> {
        let mut body = serde_json::json!({
            "chat_id": conversation_id,
            "text": message.text,
        });
        if let Some(reply_to) = &message.reply_to_message_id {
            if let Ok(id) = reply_to.parse::<i64>() {
                body["reply_to_message_id"] = serde_json::json!(id);
            }
        }

        let resp = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| HostError::Channel(format!("telegram sendMessage failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!("telegram sendMessage returned {status}: {text}");
            return Err(HostError::Channel(format!(
                "telegram sendMessage returned {status}"
            )));
        }
        Ok(())
    }

    async fn send_typing(&self, conversation_id: &str) -> Result<(), HostError> {
        let body = serde_json::json!({
            "chat_id": conversation_id,
            "action": "typing",
        });
        self.client
            .post(format!("{}/sendChatAction", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| HostError::Channel(format!("telegram sendChatAction failed: {e}")))?;
        Ok(())
    }

    async fn status(&self) -> ChannelInfo {
        let (status, error) = self.state.read().await.clone();
        ChannelInfo {
            id: self.id.clone(),
            kind: ChannelKind::Telegram,
            status,
            error,
        }
    }
}
