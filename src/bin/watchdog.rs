//! External watchdog supervisor.
//!
//! A separate process from the host: reads the heartbeat file on a fixed
//! interval, restarts a stale host, and writes a recovery-event file so the
//! next host generation can notify users. Restarts are rate-limited by a
//! sliding window; when the window is full the watchdog pauses one cycle so
//! an operator can intervene.
//!
//! Configuration is environment-only: `HEARTBEAT_FILE`, `HEARTBEAT_TIMEOUT`
//! (seconds), `CHECK_INTERVAL` (seconds), `HOST_COMMAND`, `MAX_RESTARTS`,
//! `RESTART_WINDOW` (seconds), `HEALTH_URL`, `RECOVERY_EVENT_FILE`.
//!
//! Exit codes: 0 for graceful shutdown, 1 for a fatal initialisation error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use switchboard::health::{HeartbeatPayload, RecoveryEvent};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// Grace period after spawning a fresh host before re-assessing.
const STARTUP_GRACE: Duration = Duration::from_secs(15);
/// Wait after graceful stop before force-killing.
const GRACEFUL_STOP_WAIT: Duration = Duration::from_secs(5);

struct WatchdogConfig {
    heartbeat_file: PathBuf,
    heartbeat_timeout: Duration,
    check_interval: Duration,
    host_command: String,
    max_restarts: usize,
    restart_window: Duration,
    health_url: Option<String>,
    recovery_event_file: PathBuf,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl WatchdogConfig {
    fn from_env() -> Result<Self, String> {
        let host_command =
            std::env::var("HOST_COMMAND").map_err(|_| "HOST_COMMAND is required".to_string())?;
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        let default_root = PathBuf::from(home).join(".message-agent-host").join("health");
        Ok(Self {
            heartbeat_file: std::env::var("HEARTBEAT_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_root.join("heartbeat.json")),
            heartbeat_timeout: Duration::from_secs(env_or("HEARTBEAT_TIMEOUT", 60)),
            check_interval: Duration::from_secs(env_or("CHECK_INTERVAL", 15)),
            host_command,
            max_restarts: env_or("MAX_RESTARTS", 5),
            restart_window: Duration::from_secs(env_or("RESTART_WINDOW", 300)),
            health_url: std::env::var("HEALTH_URL").ok(),
            recovery_event_file: std::env::var("RECOVERY_EVENT_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_root.join("recovery-event.json")),
        })
    }
}

/// Why the host is considered unhealthy, or `None` when it looks fine.
fn assess(heartbeat_file: &PathBuf, timeout: Duration) -> Option<String> {
    let raw = match std::fs::read_to_string(heartbeat_file) {
        Ok(raw) => raw,
        Err(_) => return Some("heartbeat file missing".to_string()),
    };
    let payload: HeartbeatPayload = match serde_json::from_str(&raw) {
        Ok(p) => p,
        Err(e) => return Some(format!("heartbeat file malformed: {e}")),
    };
    let age_ms = chrono::Utc::now().timestamp_millis() - payload.timestamp;
    if age_ms > timeout.as_millis() as i64 {
        return Some(format!("heartbeat stale ({}s old)", age_ms / 1000));
    }
    if !pid_alive(payload.pid) {
        return Some(format!("host pid {} no longer exists", payload.pid));
    }
    None
}

/// `kill -0` liveness probe.
fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn signal_pid(pid: u32, signal: &str) {
    let _ = std::process::Command::new("kill")
        .args([signal, &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status();
}

/// Heartbeat pid recorded in the file, if readable.
fn heartbeat_pid(heartbeat_file: &PathBuf) -> Option<u32> {
    let raw = std::fs::read_to_string(heartbeat_file).ok()?;
    let payload: HeartbeatPayload = serde_json::from_str(&raw).ok()?;
    Some(payload.pid)
}

fn spawn_host(command: &str) -> Option<Child> {
    info!("spawning host: {command}");
    match Command::new("sh").arg("-c").arg(command).spawn() {
        Ok(child) => Some(child),
        Err(e) => {
            error!("failed to spawn host: {e}");
            None
        }
    }
}

/// Supplementary HTTP probe: logs a warning only, never triggers restart.
async fn probe_health_url(url: &str) {
    match reqwest::Client::new()
        .get(url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => warn!("health url {url} returned {}", resp.status()),
        Err(e) => warn!("health url {url} unreachable: {e}"),
    }
}

async fn stop_host(config: &WatchdogConfig, child: &mut Option<Child>) {
    if let Some(pid) = heartbeat_pid(&config.heartbeat_file) {
        if pid_alive(pid) {
            info!("stopping host pid {pid} (graceful)");
            signal_pid(pid, "-TERM");
            tokio::time::sleep(GRACEFUL_STOP_WAIT).await;
            if pid_alive(pid) {
                warn!("host pid {pid} survived graceful stop, force-killing");
                signal_pid(pid, "-9");
            }
        }
    }
    if let Some(mut tracked) = child.take() {
        let _ = tracked.kill().await;
    }
}

async fn write_recovery_event(config: &WatchdogConfig, reason: &str, restart_count: u32) {
    let event = RecoveryEvent {
        timestamp: chrono::Utc::now().timestamp_millis(),
        reason: reason.to_string(),
        restart_count,
        watchdog_pid: std::process::id(),
    };
    if let Some(parent) = config.recovery_event_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match serde_json::to_string_pretty(&event) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&config.recovery_event_file, json) {
                warn!("failed to write recovery event: {e}");
            }
        }
        Err(e) => warn!("failed to serialise recovery event: {e}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match WatchdogConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("watchdog init failed: {e}");
            return ExitCode::from(1);
        }
    };

    info!(
        "watchdog running | heartbeat: {} | timeout: {:?} | interval: {:?}",
        config.heartbeat_file.display(),
        config.heartbeat_timeout,
        config.check_interval,
    );

    let mut child = spawn_host(&config.host_command);
    tokio::time::sleep(STARTUP_GRACE).await;

    // Sliding window of restart instants, pruned every check. Bounded by
    // MAX_RESTARTS + 1, so the linear scan is fine.
    let mut restart_instants: Vec<Instant> = Vec::new();
    let mut restart_count: u32 = 0;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.check_interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("watchdog shutting down");
                stop_host(&config, &mut child).await;
                return ExitCode::SUCCESS;
            }
        }

        if let Some(url) = &config.health_url {
            probe_health_url(url).await;
        }

        let Some(reason) = assess(&config.heartbeat_file, config.heartbeat_timeout) else {
            continue;
        };
        warn!("host unhealthy: {reason}");

        restart_instants.retain(|at| at.elapsed() < config.restart_window);
        if restart_instants.len() >= config.max_restarts {
            warn!(
                "restart rate limit hit ({} in {:?}), pausing this cycle",
                restart_instants.len(),
                config.restart_window,
            );
            continue;
        }

        stop_host(&config, &mut child).await;
        restart_count += 1;
        restart_instants.push(Instant::now());
        write_recovery_event(&config, &reason, restart_count).await;
        child = spawn_host(&config.host_command);
        tokio::time::sleep(STARTUP_GRACE).await;
    }
}
