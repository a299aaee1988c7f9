//! Heartbeat: a periodic liveness record written atomically to disk and
//! served over HTTP on a dedicated port.
//!
//! The file is the watchdog's primary health signal; the HTTP endpoint is
//! supplementary (200 when `ok`, 503 otherwise).

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_channels::ChannelManager;
use switchboard_core::traits::{ChannelInfo, ChannelStatus};
use switchboard_store::fsutil;
use tracing::{error, info, warn};

/// Aggregate host status derived from channel statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Ok,
    Degraded,
    Error,
}

/// The heartbeat record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub pid: u32,
    /// Epoch milliseconds of emission.
    pub timestamp: i64,
    pub uptime_seconds: u64,
    pub status: HostStatus,
    pub channels: Vec<ChannelInfo>,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u64,
}

/// `error` if any channel errored; `degraded` if any settled channel is not
/// connected; else `ok`.
pub fn compute_status(channels: &[ChannelInfo]) -> HostStatus {
    if channels.iter().any(|c| c.status == ChannelStatus::Error) {
        return HostStatus::Error;
    }
    let degraded = channels.iter().any(|c| {
        c.status != ChannelStatus::Connected && c.status != ChannelStatus::Connecting
    });
    if degraded {
        HostStatus::Degraded
    } else {
        HostStatus::Ok
    }
}

/// Resident set size in MB, from procfs. Zero where unavailable.
pub fn memory_rss_mb() -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb / 1024;
        }
    }
    0
}

/// Periodic heartbeat writer plus HTTP surface.
pub struct Heartbeat {
    channels: Arc<ChannelManager>,
    started: Instant,
    path: PathBuf,
}

impl Heartbeat {
    pub fn new(channels: Arc<ChannelManager>, path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            channels,
            started: Instant::now(),
            path,
        })
    }

    pub async fn payload(&self) -> HeartbeatPayload {
        let channels = self.channels.statuses().await;
        HeartbeatPayload {
            pid: std::process::id(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            uptime_seconds: self.started.elapsed().as_secs(),
            status: compute_status(&channels),
            channels,
            memory_mb: memory_rss_mb(),
        }
    }

    /// Write the heartbeat file every `interval` until aborted.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        info!("heartbeat: writing {} every {:?}", self.path.display(), interval);
        loop {
            let payload = self.payload().await;
            if let Err(e) = fsutil::atomic_write_json(&self.path, &payload).await {
                warn!("heartbeat write failed: {e}");
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Serve `GET /health` (and `GET /`) on the dedicated health port.
    pub async fn serve(self: Arc<Self>, port: u16) {
        let app = Router::new()
            .route("/", get(health_handler))
            .route("/health", get(health_handler))
            .with_state(self);
        let addr = format!("0.0.0.0:{port}");
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("health server failed to bind {addr}: {e}");
                return;
            }
        };
        info!("health server listening on {addr}");
        if let Err(e) = axum::serve(listener, app).await {
            error!("health server error: {e}");
        }
    }
}

async fn health_handler(
    State(heartbeat): State<Arc<Heartbeat>>,
) -> (StatusCode, Json<HeartbeatPayload>) {
    let payload = heartbeat.payload().await;
    let code = if payload.status == HostStatus::Ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(payload))
}
