//! One-shot migration of the legacy flat-JSON history layout.
//!
//! The old layout kept one JSON array per conversation at
//! `<legacy>/<channelId>/<conversationId>.json`. On first start, when the new
//! history root is empty, each legacy file is replayed into the segment
//! format using the file mtime as the timestamp, then the legacy directory is
//! renamed to `<path>.bak`. Individual file errors are counted and logged;
//! they never abort the migration.

use crate::history::{HistoryAppend, HistoryStore};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use switchboard_core::chat::Role;
use switchboard_core::error::HostError;
use tracing::{info, warn};

/// One entry in a legacy flat-JSON history file.
#[derive(Debug, Deserialize)]
struct LegacyEntry {
    role: Role,
    content: String,
    #[serde(default, rename = "senderId")]
    sender_id: Option<String>,
}

/// Outcome counts for operator logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct MigrationReport {
    pub conversations: usize,
    pub entries: usize,
    pub errors: usize,
}

/// Returns true when the new history root has no channel directories yet.
async fn history_root_is_empty(root: &Path) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(root).await else {
        return true;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            return false;
        }
    }
    true
}

/// Run the migration if applicable. No-op when the legacy directory is
/// missing or the new store already has data.
pub async fn migrate_legacy_history(
    legacy_root: &Path,
    store: &HistoryStore,
) -> Result<MigrationReport, HostError> {
    let mut report = MigrationReport::default();
    if !legacy_root.is_dir() {
        return Ok(report);
    }
    if !history_root_is_empty(store.root()).await {
        info!("history migration skipped: new store already populated");
        return Ok(report);
    }

    let mut channels = tokio::fs::read_dir(legacy_root).await?;
    while let Ok(Some(channel_entry)) = channels.next_entry().await {
        if !channel_entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false)
        {
            continue;
        }
        let channel_id = channel_entry.file_name().to_string_lossy().to_string();
        let mut files = match tokio::fs::read_dir(channel_entry.path()).await {
            Ok(f) => f,
            Err(e) => {
                warn!("migration: cannot list {channel_id}: {e}");
                report.errors += 1;
                continue;
            }
        };
        while let Ok(Some(file_entry)) = files.next_entry().await {
            let path = file_entry.path();
            if path.extension().map(|x| x != "json").unwrap_or(true) {
                continue;
            }
            let conversation_id = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            match replay_file(&path, store, &channel_id, &conversation_id).await {
                Ok(count) => {
                    report.conversations += 1;
                    report.entries += count;
                }
                Err(e) => {
                    warn!("migration: {} failed: {e}", path.display());
                    report.errors += 1;
                }
            }
        }
    }

    // Park the legacy tree so the migration never re-runs.
    let bak = legacy_root.with_extension("bak");
    if let Err(e) = tokio::fs::rename(legacy_root, &bak).await {
        warn!("migration: could not rename legacy dir to .bak: {e}");
    }

    info!(
        "history migration: {} conversations, {} entries, {} errors",
        report.conversations, report.entries, report.errors
    );
    Ok(report)
}

async fn replay_file(
    path: &Path,
    store: &HistoryStore,
    channel_id: &str,
    conversation_id: &str,
) -> Result<usize, HostError> {
    let raw = tokio::fs::read_to_string(path).await?;
    let entries: Vec<LegacyEntry> = serde_json::from_str(&raw)?;

    let mtime = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|_| Utc::now().to_rfc3339());

    let count = entries.len();
    for entry in entries {
        store
            .append(
                channel_id,
                conversation_id,
                HistoryAppend {
                    role: entry.role,
                    content: entry.content,
                    sender_id: entry.sender_id,
                    ts: Some(mtime.clone()),
                    ..HistoryAppend::default()
                },
            )
            .await?;
    }
    Ok(count)
}
