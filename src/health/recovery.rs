//! Post-restart recovery: the watchdog's recovery-event notice and
//! reconciliation of orphaned task files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use switchboard_channels::ChannelManager;
use switchboard_core::message::OutgoingMessage;
use switchboard_store::{Journal, JournalEvent, PersistedTask, TaskPhase, TaskStore};
use tracing::{info, warn};

/// Written by the watchdog on every restart; consumed once by the next host
/// generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryEvent {
    /// Epoch milliseconds of the restart.
    pub timestamp: i64,
    pub reason: String,
    pub restart_count: u32,
    pub watchdog_pid: u32,
}

/// Format the user-visible restart notice.
pub fn format_notice(event: &RecoveryEvent) -> String {
    let now = chrono::Utc::now();
    let downtime_secs = (now.timestamp_millis() - event.timestamp).max(0) / 1000;
    format!(
        "\u{27f3} I was restarted by the watchdog.\nReason: {}\nRestart #{}\nDowntime: about {}s\nCurrent time: {}",
        event.reason,
        event.restart_count,
        downtime_secs,
        now.to_rfc3339(),
    )
}

/// On startup: if the recovery-event file exists, notify every configured
/// `channelId:conversationId` target and remove the file. A malformed file is
/// removed without notification to avoid a poison-pill loop.
pub async fn notify_recovery(path: &Path, channels: &ChannelManager, targets: &[String]) {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(_) => return,
    };
    let event: RecoveryEvent = match serde_json::from_str(&raw) {
        Ok(event) => event,
        Err(e) => {
            warn!("recovery: malformed event file, removing: {e}");
            let _ = tokio::fs::remove_file(path).await;
            return;
        }
    };

    let notice = format_notice(&event);
    for target in targets {
        let Some((channel_id, conversation_id)) = target.split_once(':') else {
            warn!("recovery: bad notify target {target}");
            continue;
        };
        let Some(channel) = channels.get(channel_id) else {
            warn!("recovery: no channel {channel_id} for notify target");
            continue;
        };
        if let Err(e) = channel
            .send_message(conversation_id, OutgoingMessage::text(notice.clone()))
            .await
        {
            warn!("recovery: notify {target} failed: {e}");
        }
    }

    let _ = tokio::fs::remove_file(path).await;
}

/// Reconcile every orphaned file under `tasks/active/` after a restart.
///
/// Dispatch depends on the recorded phase: early phases ask the user to
/// resend, `verifying` delivers the pending response with a disclaimer,
/// `responding` delivers it verbatim, terminal phases are stale. Every
/// outcome journals `task_failed` with `recovery: true` and force-moves the
/// file to completed. Recovery itself never throws.
pub async fn recover_orphaned_tasks(
    store: &TaskStore,
    journal: &Journal,
    channels: &Arc<ChannelManager>,
) -> usize {
    let orphans = store.list_active().await;
    let count = orphans.len();
    if count > 0 {
        info!("recovery: {count} orphaned task(s) found");
    }
    for task in orphans {
        let action = dispatch_orphan(&task, channels).await;
        journal
            .record(
                JournalEvent::TaskFailed,
                &task.id,
                &task.channel_id,
                &task.conversation_id,
                serde_json::json!({
                    "recovery": true,
                    "phase": task.phase,
                    "action": action,
                }),
            )
            .await;
        store.force_complete(&task.id).await;
    }
    count
}

async fn dispatch_orphan(task: &PersistedTask, channels: &Arc<ChannelManager>) -> &'static str {
    let (text, action) = match task.phase {
        TaskPhase::Received | TaskPhase::HistoryWritten | TaskPhase::LlmCalling => (
            Some(
                "I was restarted while processing your message and lost my place. Please resend it."
                    .to_string(),
            ),
            "resend_requested",
        ),
        TaskPhase::Verifying => match &task.pending_response {
            Some(pending) => (
                Some(format!(
                    "[Recovered after interruption — response may not have been fully verified]\n\n{pending}"
                )),
                "sent_unverified",
            ),
            None => (
                Some(
                    "I was restarted while checking my answer. Please resend your message."
                        .to_string(),
                ),
                "resend_requested",
            ),
        },
        TaskPhase::Responding => match &task.pending_response {
            Some(pending) => (Some(pending.clone()), "sent_verbatim"),
            None => (
                Some(
                    "I was restarted just before replying. Please resend your message."
                        .to_string(),
                ),
                "resend_requested",
            ),
        },
        TaskPhase::Completed | TaskPhase::Failed => (None, "stale"),
    };

    if let Some(text) = text {
        match channels.get(&task.channel_id) {
            Some(channel) => {
                let reply = OutgoingMessage::reply(
                    text,
                    task.message.platform_message_id.clone(),
                );
                if let Err(e) = channel.send_message(&task.conversation_id, reply).await {
                    warn!("recovery: send for task {} failed: {e}", task.id);
                }
            }
            None => warn!(
                "recovery: no channel {} for task {}",
                task.channel_id, task.id
            ),
        }
    }
    action
}
