//! Append-only pipeline event journal.
//!
//! Same segment layout as history at `<root>/journal/<channelId>/<conversationId>/`
//! with a simpler index `{segments: [{file, sizeBytes}]}`. The tail segment's
//! size is cached in memory and flushed on rollover only. Writes are
//! fire-and-forget: failures are logged and never surfaced to the caller.

use crate::fsutil;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use switchboard_core::config::JournalConfig;
use switchboard_core::message::iso_now;
use tokio::sync::Mutex;
use tracing::warn;

const INDEX_FILE: &str = "_index.json";

/// Pipeline lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    TaskReceived,
    PipelineStarted,
    HistoryAppended,
    LlmCallStarted,
    LlmCallCompleted,
    ToolCallStarted,
    ToolCallCompleted,
    VerificationStarted,
    VerificationResult,
    ResponseSent,
    TaskCompleted,
    TaskFailed,
    SkillDispatched,
}

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub ts: String,
    pub event: JournalEvent,
    pub task_id: String,
    pub channel_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JournalSegment {
    file: String,
    size_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct JournalIndex {
    segments: Vec<JournalSegment>,
}

/// In-memory tail state per conversation, keyed `channelId:conversationId`.
#[derive(Debug, Clone)]
struct Tail {
    file: String,
    size_bytes: u64,
}

/// File-backed event journal.
#[derive(Clone)]
pub struct Journal {
    root: PathBuf,
    enabled: bool,
    max_segment_size_bytes: u64,
    max_segments: usize,
    tails: Arc<Mutex<HashMap<String, Tail>>>,
}

impl Journal {
    pub fn new(root: impl Into<PathBuf>, config: &JournalConfig) -> Self {
        Self {
            root: root.into(),
            enabled: config.enabled,
            max_segment_size_bytes: config.max_segment_size_bytes,
            max_segments: config.max_segments,
            tails: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn conversation_dir(&self, channel_id: &str, conversation_id: &str) -> PathBuf {
        self.root.join(channel_id).join(conversation_id)
    }

    /// Record one event. Never fails: storage errors are logged and swallowed.
    pub async fn record(
        &self,
        event: JournalEvent,
        task_id: &str,
        channel_id: &str,
        conversation_id: &str,
        data: serde_json::Value,
    ) {
        if !self.enabled {
            return;
        }
        let entry = JournalEntry {
            ts: iso_now(),
            event,
            task_id: task_id.to_string(),
            channel_id: channel_id.to_string(),
            conversation_id: conversation_id.to_string(),
            data,
        };
        if let Err(e) = self.write(&entry).await {
            warn!("journal: dropping {:?} event: {e}", event);
        }
    }

    async fn write(&self, entry: &JournalEntry) -> Result<(), switchboard_core::error::HostError> {
        let dir = self.conversation_dir(&entry.channel_id, &entry.conversation_id);
        let key = format!("{}:{}", entry.channel_id, entry.conversation_id);

        let mut tails = self.tails.lock().await;
        let rolled = match tails.get(&key) {
            Some(tail) if tail.size_bytes < self.max_segment_size_bytes => false,
            _ => true,
        };

        if rolled {
            // Rollover: persist the index with the new tail appended, pruning
            // past max_segments.
            let mut index: JournalIndex = fsutil::read_json(&dir.join(INDEX_FILE))
                .await?
                .unwrap_or_default();
            // Flush the previous in-memory tail size before rotating.
            if let Some(tail) = tails.get(&key) {
                if let Some(seg) = index.segments.iter_mut().find(|s| s.file == tail.file) {
                    seg.size_bytes = tail.size_bytes;
                }
            }
            let file = fsutil::segment_file_name(Utc::now());
            index.segments.push(JournalSegment {
                file: file.clone(),
                size_bytes: 0,
            });
            while index.segments.len() > self.max_segments {
                let evicted = index.segments.remove(0);
                if let Err(e) = tokio::fs::remove_file(dir.join(&evicted.file)).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("journal: failed to evict segment {}: {e}", evicted.file);
                    }
                }
            }
            fsutil::atomic_write_json(&dir.join(INDEX_FILE), &index).await?;
            tails.insert(
                key.clone(),
                Tail {
                    file,
                    size_bytes: 0,
                },
            );
        }

        let Some(tail) = tails.get_mut(&key) else {
            return Ok(());
        };
        let written = fsutil::append_line(&dir.join(&tail.file), entry).await?;
        tail.size_bytes += written;
        Ok(())
    }

    /// Read entries, newest-first, optionally filtered by channel and
    /// conversation. Walks every conversation directory when unfiltered.
    pub async fn read_entries(
        &self,
        channel_id: Option<&str>,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Vec<JournalEntry> {
        let mut entries: Vec<JournalEntry> = Vec::new();
        for dir in self.matching_dirs(channel_id, conversation_id).await {
            let index: JournalIndex = match fsutil::read_json(&dir.join(INDEX_FILE)).await {
                Ok(Some(ix)) => ix,
                _ => continue,
            };
            for seg in &index.segments {
                let raw = match tokio::fs::read_to_string(dir.join(&seg.file)).await {
                    Ok(raw) => raw,
                    Err(_) => continue,
                };
                for line in raw.lines() {
                    match serde_json::from_str::<JournalEntry>(line) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => warn!("journal: skipping corrupt line in {}: {e}", seg.file),
                    }
                }
            }
        }
        entries.sort_by(|a, b| b.ts.cmp(&a.ts));
        entries.truncate(limit);
        entries
    }

    async fn matching_dirs(
        &self,
        channel_id: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Vec<PathBuf> {
        let channels: Vec<PathBuf> = match channel_id {
            Some(ch) => vec![self.root.join(ch)],
            None => list_dirs(&self.root).await,
        };
        let mut out = Vec::new();
        for channel_dir in channels {
            match conversation_id {
                Some(conv) => out.push(channel_dir.join(conv)),
                None => out.extend(list_dirs(&channel_dir).await),
            }
        }
        out
    }
}

async fn list_dirs(path: &std::path::Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(path).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            out.push(entry.path());
        }
    }
    out
}
