//! Segmented JSONL conversation history.
//!
//! One directory per conversation: `<root>/<channelId>/<conversationId>/`
//! holding bounded-size segment files plus a `_index.json` describing them.
//! Entries are append-only; `seq` is a contiguous ascending range per
//! conversation starting at 1.

use crate::fsutil;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use switchboard_core::chat::{Role, ToolCall};
use switchboard_core::config::HistoryConfig;
use switchboard_core::error::HostError;
use switchboard_core::message::iso_now;
use tracing::warn;

const INDEX_FILE: &str = "_index.json";

/// One persisted history line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// 1-based, contiguous per conversation.
    pub seq: u64,
    /// ISO-8601.
    pub ts: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool calls made by an assistant turn, kept so a replayed transcript
    /// still pairs every tool result with its originating call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Everything the caller supplies for one append; the store assigns `seq`.
#[derive(Debug, Clone, Default)]
pub struct HistoryAppend {
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub sender_id: Option<String>,
    pub platform_message_id: Option<String>,
    pub task_id: Option<String>,
    /// Defaults to now; the legacy migration passes the file mtime.
    pub ts: Option<String>,
}

/// Metadata for one segment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMeta {
    pub file: String,
    pub first_seq: u64,
    pub last_seq: u64,
    pub count: u64,
    pub size_bytes: u64,
    pub started_at: String,
    pub ended_at: String,
}

/// The per-conversation segment index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentIndex {
    pub next_seq: u64,
    pub segments: Vec<SegmentMeta>,
}

impl Default for SegmentIndex {
    fn default() -> Self {
        Self {
            next_seq: 1,
            segments: Vec::new(),
        }
    }
}

/// File-backed conversation history store.
#[derive(Clone)]
pub struct HistoryStore {
    root: PathBuf,
    max_segment_size_bytes: u64,
    max_segments: usize,
}

impl HistoryStore {
    pub fn new(root: impl Into<PathBuf>, config: &HistoryConfig) -> Self {
        Self {
            root: root.into(),
            max_segment_size_bytes: config.max_segment_size_bytes,
            max_segments: config.max_segments,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn conversation_dir(&self, channel_id: &str, conversation_id: &str) -> PathBuf {
        self.root.join(channel_id).join(conversation_id)
    }

    async fn load_index(dir: &Path) -> Result<SegmentIndex, HostError> {
        Ok(fsutil::read_json(&dir.join(INDEX_FILE))
            .await?
            .unwrap_or_default())
    }

    /// Append one entry, assigning the next `seq`. Returns the assigned seq.
    ///
    /// Rollover decides on the last-persisted segment size: a new segment is
    /// allocated when there are no segments or the tail segment has reached
    /// `max_segment_size_bytes`. The index is flushed atomically after every
    /// append; the oldest segments are evicted past `max_segments`.
    pub async fn append(
        &self,
        channel_id: &str,
        conversation_id: &str,
        entry: HistoryAppend,
    ) -> Result<u64, HostError> {
        let dir = self.conversation_dir(channel_id, conversation_id);
        let mut index = Self::load_index(&dir).await?;

        let seq = index.next_seq;
        let ts = entry.ts.unwrap_or_else(iso_now);

        let needs_new_segment = match index.segments.last() {
            None => true,
            Some(seg) => seg.size_bytes >= self.max_segment_size_bytes,
        };
        if needs_new_segment {
            index.segments.push(SegmentMeta {
                file: fsutil::segment_file_name(Utc::now()),
                first_seq: seq,
                last_seq: seq.saturating_sub(1),
                count: 0,
                size_bytes: 0,
                started_at: ts.clone(),
                ended_at: ts.clone(),
            });
        }

        let line = HistoryEntry {
            seq,
            ts: ts.clone(),
            role: entry.role,
            content: entry.content,
            tool_call_id: entry.tool_call_id,
            tool_calls: entry.tool_calls,
            sender_id: entry.sender_id,
            platform_message_id: entry.platform_message_id,
            task_id: entry.task_id,
        };

        let Some(seg) = index.segments.last_mut() else {
            return Err(HostError::Storage("segment index empty after allocation".into()));
        };
        let written = fsutil::append_line(&dir.join(&seg.file), &line).await?;
        seg.last_seq = seq;
        seg.count += 1;
        seg.size_bytes += written;
        seg.ended_at = ts;
        index.next_seq = seq + 1;

        while index.segments.len() > self.max_segments {
            let evicted = index.segments.remove(0);
            if let Err(e) = tokio::fs::remove_file(dir.join(&evicted.file)).await {
                warn!("history: failed to evict segment {}: {e}", evicted.file);
            }
        }

        fsutil::atomic_write_json(&dir.join(INDEX_FILE), &index).await?;
        Ok(seq)
    }

    /// Return the trailing `limit` entries in sequence order.
    ///
    /// Walks segments newest-first reading whole files until at least `limit`
    /// entries are collected. Corrupt JSONL lines are skipped with a warning.
    pub async fn get_messages(
        &self,
        channel_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, HostError> {
        let dir = self.conversation_dir(channel_id, conversation_id);
        let index = Self::load_index(&dir).await?;

        let mut collected: Vec<HistoryEntry> = Vec::new();
        for seg in index.segments.iter().rev() {
            let raw = match tokio::fs::read_to_string(dir.join(&seg.file)).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("history: cannot read segment {}: {e}", seg.file);
                    continue;
                }
            };
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<HistoryEntry>(line) {
                    Ok(entry) => collected.push(entry),
                    Err(e) => warn!("history: skipping corrupt line in {}: {e}", seg.file),
                }
            }
            if collected.len() >= limit {
                break;
            }
        }

        collected.sort_by_key(|e| e.seq);
        if collected.len() > limit {
            collected.drain(..collected.len() - limit);
        }
        Ok(collected)
    }

    /// Drop a conversation's entire history (segments + index).
    pub async fn clear(&self, channel_id: &str, conversation_id: &str) -> Result<(), HostError> {
        let dir = self.conversation_dir(channel_id, conversation_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List conversation ids recorded for a channel.
    pub async fn list_conversations(&self, channel_id: &str) -> Result<Vec<String>, HostError> {
        let dir = self.root.join(channel_id);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Read the raw index for a conversation (used by tests and recovery tooling).
    pub async fn index(
        &self,
        channel_id: &str,
        conversation_id: &str,
    ) -> Result<SegmentIndex, HostError> {
        Self::load_index(&self.conversation_dir(channel_id, conversation_id)).await
    }
}
