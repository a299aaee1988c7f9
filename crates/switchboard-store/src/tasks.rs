//! Crash-safe task state store.
//!
//! Two subtrees: `tasks/active/<taskId>.json` for in-flight tasks and
//! `tasks/completed/<YYYY-MM-DD>/<taskId>.json` for terminal ones. Every
//! write is atomic so an abrupt death leaves at most a stale active file,
//! which startup recovery reconciles.

use crate::fsutil;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use switchboard_core::error::HostError;
use switchboard_core::message::{iso_now, NormalizedMessage};
use tracing::warn;

/// Pipeline phase recorded for crash recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Received,
    HistoryWritten,
    LlmCalling,
    Verifying,
    Responding,
    Completed,
    Failed,
}

/// The on-disk record of one background task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTask {
    pub id: String,
    pub channel_id: String,
    pub conversation_id: String,
    /// Snapshot of the original inbound message.
    pub message: NormalizedMessage,
    pub phase: TaskPhase,
    pub started_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_response: Option<String>,
}

/// File-backed active/completed task store.
#[derive(Clone)]
pub struct TaskStore {
    root: PathBuf,
    enabled: bool,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            root: root.into(),
            enabled,
        }
    }

    fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    fn active_path(&self, task_id: &str) -> PathBuf {
        self.active_dir().join(format!("{task_id}.json"))
    }

    fn completed_path(&self, task_id: &str) -> PathBuf {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        self.root
            .join("completed")
            .join(day)
            .join(format!("{task_id}.json"))
    }

    /// Create the active file in phase `received`.
    pub async fn persist(
        &self,
        task_id: &str,
        message: &NormalizedMessage,
    ) -> Result<(), HostError> {
        if !self.enabled {
            return Ok(());
        }
        let now = iso_now();
        let task = PersistedTask {
            id: task_id.to_string(),
            channel_id: message.channel_id.clone(),
            conversation_id: message.conversation_id.clone(),
            message: message.clone(),
            phase: TaskPhase::Received,
            started_at: now.clone(),
            updated_at: now,
            error: None,
            pending_response: None,
        };
        fsutil::atomic_write_json(&self.active_path(task_id), &task).await
    }

    /// Advance an active task's phase, optionally updating the pending
    /// response or error.
    pub async fn update_phase(
        &self,
        task_id: &str,
        phase: TaskPhase,
        pending_response: Option<String>,
        error: Option<String>,
    ) -> Result<(), HostError> {
        if !self.enabled {
            return Ok(());
        }
        let path = self.active_path(task_id);
        let Some(mut task) = fsutil::read_json::<PersistedTask>(&path).await? else {
            return Err(HostError::Storage(format!(
                "no active task file for {task_id}"
            )));
        };
        task.phase = phase;
        task.updated_at = iso_now();
        if pending_response.is_some() {
            task.pending_response = pending_response;
        }
        if error.is_some() {
            task.error = error;
        }
        fsutil::atomic_write_json(&path, &task).await
    }

    /// Move an active task under `completed/<YYYY-MM-DD>/` and unlink it.
    pub async fn complete(&self, task_id: &str) -> Result<(), HostError> {
        if !self.enabled {
            return Ok(());
        }
        let path = self.active_path(task_id);
        let Some(mut task) = fsutil::read_json::<PersistedTask>(&path).await? else {
            return Err(HostError::Storage(format!(
                "no active task file for {task_id}"
            )));
        };
        if !matches!(task.phase, TaskPhase::Failed) {
            task.phase = TaskPhase::Completed;
        }
        task.updated_at = iso_now();
        fsutil::atomic_write_json(&self.completed_path(task_id), &task).await?;
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    /// Mark an active task failed, then move it to completed.
    pub async fn fail(&self, task_id: &str, error: &str) -> Result<(), HostError> {
        if !self.enabled {
            return Ok(());
        }
        self.update_phase(task_id, TaskPhase::Failed, None, Some(error.to_string()))
            .await?;
        self.complete(task_id).await
    }

    /// Enumerate `active/`, skipping unreadable files with a warning so a
    /// poison file never aborts recovery.
    pub async fn list_active(&self) -> Vec<PersistedTask> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.active_dir()).await {
            Ok(e) => e,
            Err(_) => return out,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map(|x| x != "json").unwrap_or(true) {
                continue;
            }
            match fsutil::read_json::<PersistedTask>(&path).await {
                Ok(Some(task)) => out.push(task),
                Ok(None) => {}
                Err(e) => warn!("tasks: skipping unreadable {}: {e}", path.display()),
            }
        }
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    /// Force-move a stuck active file to completed, synthesising a record if
    /// the file is unreadable. Used by recovery to avoid infinite re-recovery.
    pub async fn force_complete(&self, task_id: &str) {
        if let Err(e) = self.complete(task_id).await {
            warn!("tasks: force-complete of {task_id} failed: {e}");
            let _ = tokio::fs::remove_file(self.active_path(task_id)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(name: &str) -> (TaskStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("__switchboard_test_tasks_{name}__"));
        let _ = std::fs::remove_dir_all(&dir);
        (TaskStore::new(&dir, true), dir)
    }

    fn msg() -> NormalizedMessage {
        NormalizedMessage::new("web", "c1", "web-user", "hi")
    }

    #[tokio::test]
    async fn test_persist_creates_active_in_received() {
        let (store, dir) = store("persist");
        store.persist("task-1", &msg()).await.unwrap();
        let active = store.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "task-1");
        assert_eq!(active[0].phase, TaskPhase::Received);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_phase_advance_and_pending_response() {
        let (store, dir) = store("phase");
        store.persist("task-1", &msg()).await.unwrap();
        store
            .update_phase("task-1", TaskPhase::Verifying, Some("draft".into()), None)
            .await
            .unwrap();
        let active = store.list_active().await;
        assert_eq!(active[0].phase, TaskPhase::Verifying);
        assert_eq!(active[0].pending_response.as_deref(), Some("draft"));
        // A later phase update without a response keeps the recorded one.
        store
            .update_phase("task-1", TaskPhase::Responding, None, None)
            .await
            .unwrap();
        let active = store.list_active().await;
        assert_eq!(active[0].pending_response.as_deref(), Some("draft"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_complete_moves_out_of_active() {
        let (store, dir) = store("complete");
        store.persist("task-1", &msg()).await.unwrap();
        store.complete("task-1").await.unwrap();
        assert!(store.list_active().await.is_empty());
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let completed = dir.join("completed").join(day).join("task-1.json");
        assert!(completed.exists());
        let task: PersistedTask = serde_json::from_str(
            &std::fs::read_to_string(&completed).unwrap(),
        )
        .unwrap();
        assert_eq!(task.phase, TaskPhase::Completed);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_fail_records_error_and_completes() {
        let (store, dir) = store("fail");
        store.persist("task-1", &msg()).await.unwrap();
        store.fail("task-1", "llm unreachable").await.unwrap();
        assert!(store.list_active().await.is_empty());
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let completed = dir.join("completed").join(day).join("task-1.json");
        let task: PersistedTask = serde_json::from_str(
            &std::fs::read_to_string(&completed).unwrap(),
        )
        .unwrap();
        assert_eq!(task.phase, TaskPhase::Failed);
        assert_eq!(task.error.as_deref(), Some("llm unreachable"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_list_active_skips_unreadable() {
        let (store, dir) = store("unreadable");
        store.persist("task-1", &msg()).await.unwrap();
        std::fs::write(dir.join("active").join("junk.json"), "{ not json").unwrap();
        let active = store.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "task-1");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_disabled_store_is_inert() {
        let dir = std::env::temp_dir().join("__switchboard_test_tasks_disabled__");
        let _ = std::fs::remove_dir_all(&dir);
        let store = TaskStore::new(&dir, false);
        store.persist("task-1", &msg()).await.unwrap();
        assert!(!dir.exists());
        assert!(store.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_persisted_task_serde_identity() {
        let (store, dir) = store("serde");
        store.persist("task-1", &msg()).await.unwrap();
        let active = store.list_active().await;
        let json = serde_json::to_string(&active[0]).unwrap();
        let back: PersistedTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, active[0].id);
        assert_eq!(back.message.text, "hi");
        assert!(json.contains("\"channelId\""));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
