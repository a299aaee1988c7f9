//! SSE fan-out: conversationId → set of subscriber connections.

use axum::response::sse::Event;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::debug;

/// Tracks the SSE subscribers of every conversation. Broken connections are
/// pruned silently on the next send.
#[derive(Clone, Default)]
pub struct SseManager {
    subscribers: Arc<Mutex<HashMap<String, Vec<UnboundedSender<Event>>>>>,
}

impl SseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for a conversation. The returned receiver feeds
    /// the response stream; dropping it unsubscribes on the next send.
    pub async fn register(&self, conversation_id: &str) -> UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().await;
        subscribers
            .entry(conversation_id.to_string())
            .or_default()
            .push(tx);
        debug!(
            "sse: subscriber added for {conversation_id} ({} total)",
            subscribers
                .get(conversation_id)
                .map(|v| v.len())
                .unwrap_or(0)
        );
        rx
    }

    /// Send one event to every subscriber of a conversation, pruning closed
    /// connections.
    pub async fn send(&self, conversation_id: &str, event: &str, data: serde_json::Value) {
        let mut subscribers = self.subscribers.lock().await;
        let Some(connections) = subscribers.get_mut(conversation_id) else {
            return;
        };
        let payload = Event::default()
            .event(event)
            .data(data.to_string());
        connections.retain(|tx| tx.send(payload.clone()).is_ok());
        if connections.is_empty() {
            subscribers.remove(conversation_id);
        }
    }

    /// Drop every subscriber (server shutdown closes the streams).
    pub async fn close_all(&self) {
        self.subscribers.lock().await.clear();
    }

    pub async fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.subscribers
            .lock()
            .await
            .get(conversation_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}
