//! Channel registry and fan-out operations.

use std::collections::HashMap;
use std::sync::Arc;
use switchboard_core::traits::{Channel, ChannelInfo, MessageHandler};
use tracing::{error, info};

/// Owns the set of channels keyed by id.
#[derive(Default)]
pub struct ChannelManager {
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    pub fn insert(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.id().to_string(), channel);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<dyn Channel>> {
        self.channels.values()
    }

    /// Register the single shared handler on every channel.
    pub fn register_handler(&self, handler: MessageHandler) {
        for channel in self.channels.values() {
            channel.on_message(handler.clone());
        }
    }

    /// Connect every channel. A failure on one is logged and the others
    /// proceed; never short-circuits.
    pub async fn connect_all(&self) {
        for (id, channel) in &self.channels {
            match channel.connect().await {
                Ok(()) => info!("channel {id} connected"),
                Err(e) => error!("channel {id} failed to connect: {e}"),
            }
        }
    }

    /// Disconnect every channel, logging per-channel failures.
    pub async fn disconnect_all(&self) {
        for (id, channel) in &self.channels {
            if let Err(e) = channel.disconnect().await {
                error!("channel {id} failed to disconnect: {e}");
            }
        }
    }

    /// Aggregated statuses, sorted by channel id.
    pub async fn statuses(&self) -> Vec<ChannelInfo> {
        let mut out = Vec::with_capacity(self.channels.len());
        for channel in self.channels.values() {
            out.push(channel.status().await);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
