//! Background task lifecycle.
//!
//! The task manager is the submission surface for background work: it
//! allocates task ids, keeps the in-memory active map, drives the typing
//! keepalive per conversation, persists task state for crash recovery, and
//! accounts for completion and failure. Failed tasks produce a best-effort
//! error reply to the user through the originating channel.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use switchboard_channels::ChannelManager;
use switchboard_core::error::HostError;
use switchboard_core::message::{iso_now, NormalizedMessage, OutgoingMessage};
use switchboard_store::{Journal, JournalEvent, TaskStore};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

/// Typing indicator cadence, kept below the 5 s platform timeout.
const TYPING_CADENCE: Duration = Duration::from_secs(4);

/// Status of an in-flight task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// In-memory counterpart of a persisted task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTask {
    pub id: String,
    pub channel_id: String,
    pub conversation_id: String,
    pub status: TaskStatus,
    pub started_at: String,
}

/// Submission surface for background pipeline work.
pub struct TaskManager {
    store: TaskStore,
    journal: Journal,
    channels: Arc<ChannelManager>,
    active: Mutex<HashMap<String, ConversationTask>>,
    /// Typing keepalive timers keyed `channelId:conversationId`.
    typing: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new(store: TaskStore, journal: Journal, channels: Arc<ChannelManager>) -> Self {
        Self {
            store,
            journal,
            channels,
            active: Mutex::new(HashMap::new()),
            typing: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a background task running `pipeline`. Returns the task id
    /// immediately; the pipeline runs concurrently.
    pub async fn submit<F, Fut>(self: &Arc<Self>, message: NormalizedMessage, pipeline: F) -> String
    where
        F: FnOnce(NormalizedMessage, String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HostError>> + Send + 'static,
    {
        let task_id = Uuid::new_v4().to_string();
        let key = message.conversation_key();

        {
            let mut active = self.active.lock().await;
            active.insert(
                task_id.clone(),
                ConversationTask {
                    id: task_id.clone(),
                    channel_id: message.channel_id.clone(),
                    conversation_id: message.conversation_id.clone(),
                    status: TaskStatus::Running,
                    started_at: iso_now(),
                },
            );
        }

        self.start_typing(&key, &message.channel_id, &message.conversation_id)
            .await;

        if let Err(e) = self.store.persist(&task_id, &message).await {
            warn!("task {task_id}: persist failed: {e}");
        }
        self.journal
            .record(
                JournalEvent::TaskReceived,
                &task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::json!({"messageId": message.id}),
            )
            .await;

        let manager = self.clone();
        let spawn_id = task_id.clone();
        tokio::spawn(async move {
            let result = pipeline(message.clone(), spawn_id.clone()).await;
            match result {
                Ok(()) => manager.finish(&spawn_id, &message, None).await,
                Err(e) => manager.finish(&spawn_id, &message, Some(e)).await,
            }
        });

        task_id
    }

    /// Completion/failure accounting: update the persisted record, drop the
    /// in-memory entry, stop typing when the conversation has no other active
    /// task, and on failure send the user-facing error reply.
    async fn finish(&self, task_id: &str, message: &NormalizedMessage, failure: Option<HostError>) {
        let key = message.conversation_key();

        match &failure {
            None => {
                if let Err(e) = self.store.complete(task_id).await {
                    warn!("task {task_id}: complete failed: {e}");
                }
            }
            Some(cause) => {
                error!("task {task_id} failed: {cause}");
                if let Err(e) = self.store.fail(task_id, &cause.to_string()).await {
                    warn!("task {task_id}: fail-persist failed: {e}");
                }
                self.journal
                    .record(
                        JournalEvent::TaskFailed,
                        task_id,
                        &message.channel_id,
                        &message.conversation_id,
                        serde_json::json!({"error": cause.to_string()}),
                    )
                    .await;
                // Best-effort error reply to the user.
                if let Some(channel) = self.channels.get(&message.channel_id) {
                    let reply = OutgoingMessage::reply(
                        format!(
                            "\u{26a0} An error occurred processing your message: {cause}"
                        ),
                        message.platform_message_id.clone(),
                    );
                    if let Err(e) = channel.send_message(&message.conversation_id, reply).await {
                        warn!("task {task_id}: error reply failed: {e}");
                    }
                }
            }
        }

        let conversation_still_busy = {
            let mut active = self.active.lock().await;
            active.remove(task_id);
            active
                .values()
                .any(|t| t.channel_id == message.channel_id && t.conversation_id == message.conversation_id)
        };
        if !conversation_still_busy {
            self.stop_typing(&key).await;
        }
    }

    /// Start (or keep alive) the periodic typing emitter for a conversation.
    async fn start_typing(&self, key: &str, channel_id: &str, conversation_id: &str) {
        let mut typing = self.typing.lock().await;
        if typing.contains_key(key) {
            return;
        }
        let Some(channel) = self.channels.get(channel_id) else {
            return;
        };
        let conversation_id = conversation_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                // Emitter errors are swallowed; typing is cosmetic.
                let _ = channel.send_typing(&conversation_id).await;
                tokio::time::sleep(TYPING_CADENCE).await;
            }
        });
        typing.insert(key.to_string(), handle);
    }

    async fn stop_typing(&self, key: &str) {
        if let Some(handle) = self.typing.lock().await.remove(key) {
            handle.abort();
        }
    }

    /// Snapshot of in-memory active tasks.
    pub async fn active_snapshot(&self) -> Vec<ConversationTask> {
        let active = self.active.lock().await;
        let mut out: Vec<ConversationTask> = active.values().cloned().collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Whether a typing timer currently exists for a conversation key.
    /// Exposed for tests of keepalive cleanup.
    pub async fn typing_active(&self, key: &str) -> bool {
        self.typing.lock().await.contains_key(key)
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use switchboard_core::config::JournalConfig;
    use switchboard_core::traits::{
        Channel, ChannelInfo, ChannelKind, ChannelStatus, MessageHandler,
    };

    struct RecordingChannel {
        sent: std::sync::Mutex<Vec<(String, OutgoingMessage)>>,
        typing_count: AtomicUsize,
    }

    impl RecordingChannel {
        fn new() -> Self {
            Self {
                sent: std::sync::Mutex::new(Vec::new()),
                typing_count: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn id(&self) -> &str {
            "web"
        }

        fn kind(&self) -> ChannelKind {
            ChannelKind::Web
        }

        fn on_message(&self, _handler: MessageHandler) {}

        async fn connect(&self) -> Result<(), HostError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), HostError> {
            Ok(())
        }

        async fn send_message(
            &self,
            conversation_id: &str,
            message: OutgoingMessage,
        ) -> Result<(), HostError> {
            self.sent
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), message));
            Ok(())
        }

        async fn send_typing(&self, _conversation_id: &str) -> Result<(), HostError> {
            self.typing_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn status(&self) -> ChannelInfo {
            ChannelInfo {
                id: "web".into(),
                kind: ChannelKind::Web,
                status: ChannelStatus::Connected,
                error: None,
            }
        }
    }

    fn fixture(name: &str) -> (Arc<TaskManager>, Arc<RecordingChannel>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("__switchboard_test_taskmgr_{name}__"));
        let _ = std::fs::remove_dir_all(&dir);
        let channel = Arc::new(RecordingChannel::new());
        let mut channels = ChannelManager::new();
        channels.insert(channel.clone());
        let manager = Arc::new(TaskManager::new(
            TaskStore::new(dir.join("tasks"), true),
            Journal::new(dir.join("journal"), &JournalConfig::default()),
            Arc::new(channels),
        ));
        (manager, channel, dir)
    }

    fn msg() -> NormalizedMessage {
        let mut m = NormalizedMessage::new("web", "c1", "web-user", "hi");
        m.platform_message_id = Some("pm1".into());
        m
    }

    #[tokio::test]
    async fn test_successful_task_completes_and_cleans_up() {
        let (manager, _channel, dir) = fixture("ok");
        let task_id = manager.submit(msg(), |_msg, _id| async { Ok(()) }).await;

        // Wait for the spawned pipeline to finish.
        for _ in 0..50 {
            if manager.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.active_count().await, 0);
        assert!(!manager.typing_active("web:c1").await);
        assert!(manager.store().list_active().await.is_empty());
        // Completed file exists.
        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        assert!(dir
            .join("tasks")
            .join("completed")
            .join(day)
            .join(format!("{task_id}.json"))
            .exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_failed_task_sends_error_reply() {
        let (manager, channel, dir) = fixture("fail");
        manager
            .submit(msg(), |_msg, _id| async {
                Err(HostError::Llm("backend unreachable".into()))
            })
            .await;

        for _ in 0..50 {
            if manager.active_count().await == 0 && !channel.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "c1");
        assert!(sent[0].1.text.starts_with('\u{26a0}'));
        assert!(sent[0].1.text.contains("backend unreachable"));
        assert_eq!(sent[0].1.reply_to_message_id.as_deref(), Some("pm1"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_typing_survives_while_sibling_task_runs() {
        let (manager, _channel, dir) = fixture("sibling");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let rx = Arc::new(Mutex::new(Some(rx)));

        // Long-running task holds the conversation open.
        let hold = rx.clone();
        manager
            .submit(msg(), move |_msg, _id| async move {
                let rx = hold.lock().await.take();
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok(())
            })
            .await;
        // Quick sibling task on the same conversation.
        manager.submit(msg(), |_msg, _id| async { Ok(()) }).await;

        for _ in 0..50 {
            if manager.active_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(
            manager.typing_active("web:c1").await,
            "typing stays while a sibling is active"
        );

        let _ = tx.send(());
        for _ in 0..50 {
            if manager.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!manager.typing_active("web:c1").await);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_typing_emits_repeatedly() {
        let (manager, channel, dir) = fixture("cadence");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let rx = Arc::new(Mutex::new(Some(rx)));
        let hold = rx.clone();
        manager
            .submit(msg(), move |_msg, _id| async move {
                let rx = hold.lock().await.take();
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok(())
            })
            .await;

        // At least the immediate first emission.
        for _ in 0..50 {
            if channel.typing_count.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(channel.typing_count.load(Ordering::SeqCst) >= 1);
        let _ = tx.send(());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
