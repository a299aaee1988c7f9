//! Channel monitor: self-healing reconnection with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchboard_channels::ChannelManager;
use switchboard_core::config::HealthConfig;
use switchboard_core::traits::ChannelStatus;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Watches channel statuses and reconnects unhealthy channels.
pub struct ChannelMonitor {
    channels: Arc<ChannelManager>,
    config: HealthConfig,
    /// Consecutive reconnect failures per channel id.
    failures: Mutex<HashMap<String, u32>>,
}

/// `min(base · 2^failures, max)`.
pub fn backoff_delay(base_ms: u64, failures: u32, max_ms: u64) -> Duration {
    let exp = failures.min(31);
    let delay = base_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(delay.min(max_ms))
}

impl ChannelMonitor {
    pub fn new(channels: Arc<ChannelManager>, config: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            channels,
            config,
            failures: Mutex::new(HashMap::new()),
        })
    }

    /// Run check cycles until aborted.
    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.check_interval_ms);
        loop {
            tokio::time::sleep(interval).await;
            self.check_channels().await;
        }
    }

    /// One check cycle over every channel.
    pub(crate) async fn check_channels(&self) {
        let channel_list: Vec<_> = self.channels.channels().cloned().collect();
        for channel in channel_list {
            let info = channel.status().await;
            match info.status {
                ChannelStatus::Connected => {
                    self.failures.lock().await.remove(&info.id);
                }
                ChannelStatus::Connecting => {
                    // A connect is already in flight; leave it alone.
                }
                _ => {
                    let failures = {
                        let map = self.failures.lock().await;
                        map.get(&info.id).copied().unwrap_or(0)
                    };
                    if failures >= self.config.max_reconnect_attempts {
                        // Cooldown: reset the counter and skip one cycle.
                        warn!(
                            "channel {}: {} consecutive reconnect failures, cooling down",
                            info.id, failures
                        );
                        self.failures.lock().await.remove(&info.id);
                        continue;
                    }

                    let delay = backoff_delay(
                        self.config.reconnect_base_delay_ms,
                        failures,
                        self.config.reconnect_max_delay_ms,
                    );
                    info!(
                        "channel {}: reconnecting in {:?} (failure #{failures})",
                        info.id, delay
                    );
                    tokio::time::sleep(delay).await;

                    let _ = channel.disconnect().await;
                    match channel.connect().await {
                        Ok(()) => {
                            info!("channel {}: reconnected", info.id);
                            self.failures.lock().await.remove(&info.id);
                        }
                        Err(e) => {
                            warn!("channel {}: reconnect failed: {e}", info.id);
                            *self.failures.lock().await.entry(info.id.clone()).or_insert(0) += 1;
                        }
                    }
                }
            }
        }
    }
}
