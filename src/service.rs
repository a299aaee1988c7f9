//! Composition root: builds every layer from the configuration, wires them
//! together, and runs the host until shutdown.

use crate::agent::AgentService;
use crate::health::{self, ChannelMonitor, Heartbeat};
use crate::tasks::TaskManager;
use crate::web::{self, AppState, SseManager, WebChannel};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_channels::{ChannelManager, TelegramChannel};
use switchboard_core::config::{data_dir, Config};
use switchboard_core::traits::ChannelKind;
use switchboard_llm::LlmService;
use switchboard_mcp::McpClientManager;
use switchboard_skills::{builtin_skills, SkillRegistry};
use switchboard_store::{migrate, HistoryStore, Journal, TaskStore};
use tracing::{error, info, warn};

/// Run the host until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    // Background task panics must not take the host down; the watchdog owns
    // whole-process failure recovery.
    std::panic::set_hook(Box::new(|info| {
        error!("panic in task: {info}");
    }));

    let root = data_dir();
    let history_root = config
        .history
        .data_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| root.join("history"));

    // --- Storage ---
    let history = HistoryStore::new(&history_root, &config.history);
    let legacy = PathBuf::from("./data/history");
    if let Err(e) = migrate::migrate_legacy_history(&legacy, &history).await {
        warn!("legacy history migration failed: {e}");
    }
    let journal = Journal::new(root.join("journal"), &config.journal);
    let task_store = TaskStore::new(root.join("tasks"), config.task_persistence.enabled);

    // --- LLM ---
    let llm = LlmService::from_config(&config.llm)?;
    let review_llm = if config.verification.llm_review.enabled {
        Some(LlmService::for_review(
            &config.llm,
            &config.verification.llm_review,
        )?)
    } else {
        None
    };
    info!("llm backend: {}", llm.backend_name());

    // --- Tools ---
    let mcp = Arc::new(McpClientManager::connect_all(&config.mcp).await);
    let skills = Arc::new(SkillRegistry::new());
    for skill in builtin_skills() {
        skills.register(skill);
    }
    skills.load_directories(&config.skills.directories);

    // --- Channels ---
    let sse = SseManager::new();
    let mut manager = ChannelManager::new();
    let mut web_channel: Option<Arc<WebChannel>> = None;
    for (id, channel_config) in &config.channels {
        if !channel_config.enabled {
            continue;
        }
        match channel_config.kind {
            ChannelKind::Telegram => match &channel_config.token {
                Some(token) => manager.insert(Arc::new(TelegramChannel::new(id, token))),
                None => warn!("channel {id}: telegram requires a token, skipping"),
            },
            ChannelKind::Web => {
                let channel = Arc::new(WebChannel::new(id, sse.clone()));
                web_channel = Some(channel.clone());
                manager.insert(channel);
            }
            other => {
                warn!(
                    "channel {id}: no built-in transport for type {}, skipping",
                    other.as_str()
                );
            }
        }
    }
    // The browser surface is on by default even with no explicit channel entry.
    if web_channel.is_none() && config.web.enabled {
        let channel = Arc::new(WebChannel::new("web", sse.clone()));
        web_channel = Some(channel.clone());
        manager.insert(channel);
    }
    let channels = Arc::new(manager);

    // --- Pipeline ---
    let tasks = Arc::new(TaskManager::new(
        task_store,
        journal.clone(),
        channels.clone(),
    ));
    let agent = AgentService::new(
        config.clone(),
        history.clone(),
        journal.clone(),
        llm,
        review_llm,
        mcp.clone(),
        skills.clone(),
        channels.clone(),
        tasks.clone(),
    );
    channels.register_handler(agent.handler());
    channels.connect_all().await;

    // --- Recovery (after channels so notices can be delivered) ---
    let recovery_event = root.join("health").join("recovery-event.json");
    health::notify_recovery(
        &recovery_event,
        &channels,
        &config.health.recovery_notify_targets,
    )
    .await;
    if config.task_persistence.recover_on_startup {
        let recovered =
            health::recover_orphaned_tasks(tasks.store(), &journal, &channels).await;
        if recovered > 0 {
            info!("recovered {recovered} orphaned task(s)");
        }
    }

    // --- Health ---
    let mut background = Vec::new();
    let heartbeat = Heartbeat::new(channels.clone(), root.join("health").join("heartbeat.json"));
    if config.health.enabled {
        background.push(tokio::spawn(heartbeat.clone().run(Duration::from_secs(
            config.health.heartbeat_interval_secs,
        ))));
        background.push(tokio::spawn(heartbeat.clone().serve(config.health.port)));
        let monitor = ChannelMonitor::new(channels.clone(), config.health.clone());
        background.push(tokio::spawn(monitor.run()));
    }

    // --- Web ---
    if config.web.enabled {
        if let Some(web_channel) = web_channel {
            let state = AppState {
                web: web_channel,
                sse: sse.clone(),
                history: history.clone(),
                journal: journal.clone(),
                tasks: tasks.clone(),
                channels: channels.clone(),
                started: Instant::now(),
            };
            background.push(tokio::spawn(web::serve(state, config.web.port)));
        }
    }

    info!(
        "switchboard host running | persona: {} | channels: {}",
        config.persona.name,
        channels.ids().join(", "),
    );

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");

    // Graceful shutdown. In-flight pipelines are not cancelled; orphans are
    // reconciled on the next start.
    for handle in &background {
        handle.abort();
    }
    sse.close_all().await;
    channels.disconnect_all().await;
    mcp.disconnect_all().await;

    info!("shutdown complete");
    Ok(())
}
