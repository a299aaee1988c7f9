//! End-to-end pipeline scenarios: a scripted LLM backend, the real stores,
//! the real task manager, and the in-process web channel.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard::agent::AgentService;
use switchboard::tasks::TaskManager;
use switchboard::web::{SseManager, WebChannel};
use switchboard_channels::ChannelManager;
use switchboard_core::chat::{ChatMessage, LlmReply, Role, ToolCall, ToolDefinition};
use switchboard_core::config::{Config, McpConfig, McpServerConfig, VerificationConfig};
use switchboard_core::error::HostError;
use switchboard_core::message::NormalizedMessage;
use switchboard_core::traits::Channel;
use switchboard_llm::{LlmBackend, LlmService};
use switchboard_mcp::McpClientManager;
use switchboard_skills::{builtin_skills, Skill, SkillRegistry};
use switchboard_store::{HistoryAppend, HistoryStore, Journal, JournalEntry, JournalEvent, TaskStore};

/// Replays a canned list of replies; repeats a plain fallback when empty.
struct ScriptedBackend {
    replies: std::sync::Mutex<VecDeque<LlmReply>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new(replies: Vec<LlmReply>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<LlmReply, HostError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| LlmReply::text("fallback")))
    }

    async fn is_available(&self) -> bool {
        true
    }
}

struct Harness {
    agent: Arc<AgentService>,
    tasks: Arc<TaskManager>,
    history: HistoryStore,
    journal: Journal,
    sse: SseManager,
    skills: Arc<SkillRegistry>,
    backend: Arc<ScriptedBackend>,
    dir: PathBuf,
}

impl Harness {
    async fn new(
        name: &str,
        replies: Vec<LlmReply>,
        verification: VerificationConfig,
        mcp: McpClientManager,
    ) -> Self {
        let dir = std::env::temp_dir().join(format!("__switchboard_e2e_{name}__"));
        let _ = std::fs::remove_dir_all(&dir);

        let mut config = Config::default();
        config.verification = verification;

        let history = HistoryStore::new(dir.join("history"), &config.history);
        let journal = Journal::new(dir.join("journal"), &config.journal);
        let task_store = TaskStore::new(dir.join("tasks"), true);

        let sse = SseManager::new();
        let web = Arc::new(WebChannel::new("web", sse.clone()));
        let mut manager = ChannelManager::new();
        manager.insert(web.clone());
        let channels = Arc::new(manager);

        let tasks = Arc::new(TaskManager::new(task_store, journal.clone(), channels.clone()));
        let skills = Arc::new(SkillRegistry::new());
        for skill in builtin_skills() {
            skills.register(skill);
        }

        let backend = Arc::new(ScriptedBackend::new(replies));
        let llm = LlmService::new(backend.clone());

        let agent = AgentService::new(
            config,
            history.clone(),
            journal.clone(),
            llm,
            None,
            Arc::new(mcp),
            skills.clone(),
            channels.clone(),
            tasks.clone(),
        );
        channels.register_handler(agent.handler());
        web.connect().await.unwrap();

        Self {
            agent,
            tasks,
            history,
            journal,
            sse,
            skills,
            backend,
            dir,
        }
    }

    async fn send(&self, conversation_id: &str, text: &str) {
        let msg = NormalizedMessage::new("web", conversation_id, "web-user", text);
        self.agent.handle_message(msg).await;
    }

    /// Wait until no task is in flight.
    async fn wait_idle(&self) {
        for _ in 0..300 {
            if self.tasks.active_count().await == 0 {
                // One more beat so post-completion accounting settles.
                tokio::time::sleep(Duration::from_millis(20)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tasks never went idle");
    }

    /// Journal entries for one conversation in chronological order.
    async fn journal_timeline(&self, conversation_id: &str) -> Vec<JournalEntry> {
        let mut entries = self
            .journal
            .read_entries(Some("web"), Some(conversation_id), 200)
            .await;
        entries.reverse();
        entries
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Pull SSE events until the next `message` event, skipping typing
/// indicators from the keepalive.
async fn recv_message_event(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<axum::response::sse::Event>,
) -> String {
    for _ in 0..50 {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("sse event within deadline")
            .expect("sse stream open");
        let rendered = format!("{event:?}");
        if rendered.contains("typing") {
            continue;
        }
        return rendered;
    }
    panic!("no message event arrived");
}

fn event_positions(timeline: &[JournalEntry], events: &[JournalEvent]) -> Vec<usize> {
    events
        .iter()
        .map(|wanted| {
            timeline
                .iter()
                .position(|e| e.event == *wanted)
                .unwrap_or_else(|| panic!("event {wanted:?} missing from journal"))
        })
        .collect()
}

fn verification_off() -> VerificationConfig {
    VerificationConfig::default()
}

fn verification_on() -> VerificationConfig {
    VerificationConfig {
        enabled: true,
        skip_for_short_responses: false,
        ..VerificationConfig::default()
    }
}

// --- Scenario: simple echo ---

#[tokio::test]
async fn simple_echo_writes_history_and_streams_response() {
    let harness = Harness::new(
        "echo",
        vec![LlmReply::text("Hello there!")],
        verification_off(),
        McpClientManager::new(),
    )
    .await;

    let mut rx = harness.sse.register("c1").await;
    harness.send("c1", "hi").await;
    harness.wait_idle().await;

    // One user + one assistant history entry.
    let messages = harness.history.get_messages("web", "c1", 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hello there!");

    // One SSE message event reached the subscriber.
    let rendered = recv_message_event(&mut rx).await;
    assert!(rendered.contains("Hello there!"));

    // Journal order.
    let timeline = harness.journal_timeline("c1").await;
    let positions = event_positions(
        &timeline,
        &[
            JournalEvent::PipelineStarted,
            JournalEvent::LlmCallStarted,
            JournalEvent::LlmCallCompleted,
            JournalEvent::ResponseSent,
            JournalEvent::TaskCompleted,
        ],
    );
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    harness.cleanup();
}

// --- Scenario: slash command dispatch (/clear) ---

#[tokio::test]
async fn clear_command_is_synchronous_and_skips_pipeline() {
    let harness = Harness::new(
        "clear",
        vec![],
        verification_off(),
        McpClientManager::new(),
    )
    .await;

    for i in 0..5 {
        harness
            .history
            .append(
                "web",
                "c1",
                HistoryAppend {
                    content: format!("old message {i}"),
                    ..HistoryAppend::default()
                },
            )
            .await
            .unwrap();
    }

    let mut rx = harness.sse.register("c1").await;
    harness.send("c1", "/clear").await;

    // Builtin dispatch is synchronous: the reply is already sent.
    let event = rx.try_recv().expect("synchronous reply");
    assert!(format!("{event:?}").contains("Conversation history cleared."));

    assert!(harness
        .history
        .get_messages("web", "c1", 10)
        .await
        .unwrap()
        .is_empty());

    // No task was submitted, no pipeline ran.
    assert_eq!(harness.tasks.active_count().await, 0);
    let timeline = harness.journal_timeline("c1").await;
    assert!(timeline
        .iter()
        .all(|e| e.event != JournalEvent::PipelineStarted));
    assert!(timeline
        .iter()
        .any(|e| e.event == JournalEvent::SkillDispatched));
    assert_eq!(harness.backend.calls.load(Ordering::SeqCst), 0);

    harness.cleanup();
}

// --- Scenario: verification REDO ---

#[tokio::test]
async fn empty_response_is_redone_and_regenerated() {
    let harness = Harness::new(
        "redo",
        vec![
            LlmReply::text(""),
            LlmReply::text("Here is the actual answer."),
        ],
        verification_on(),
        McpClientManager::new(),
    )
    .await;

    let mut rx = harness.sse.register("c1").await;
    harness.send("c1", "tell me the answer now").await;
    harness.wait_idle().await;

    let rendered = recv_message_event(&mut rx).await;
    assert!(rendered.contains("Here is the actual answer."));

    let timeline = harness.journal_timeline("c1").await;
    let completed = timeline
        .iter()
        .filter(|e| e.event == JournalEvent::LlmCallCompleted)
        .count();
    assert_eq!(completed, 2, "initial call plus one regeneration");

    let redo_results: Vec<_> = timeline
        .iter()
        .filter(|e| e.event == JournalEvent::VerificationResult && e.data["rating"] == "REDO")
        .collect();
    assert_eq!(redo_results.len(), 1);

    let messages = harness.history.get_messages("web", "c1", 10).await.unwrap();
    assert_eq!(
        messages.last().unwrap().content,
        "Here is the actual answer."
    );

    harness.cleanup();
}

// --- Scenario: tool use through MCP ---

fn scripted_mcp_config() -> McpConfig {
    let script = r#"
read line; printf '%s\n' '{"jsonrpc":"2.0","result":{"protocolVersion":"2024-11-05"},"id":1}'
read line
read line; printf '%s\n' '{"jsonrpc":"2.0","result":{"tools":[{"name":"add","description":"Add two numbers","inputSchema":{"type":"object"}}]},"id":2}'
read line; printf '%s\n' '{"jsonrpc":"2.0","result":{"content":[{"type":"text","text":"5"}]},"id":3}'
"#;
    let mut config = McpConfig::default();
    config.servers.insert(
        "calc".into(),
        McpServerConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            ..Default::default()
        },
    );
    config
}

#[tokio::test]
async fn tool_call_roundtrip_lands_in_history() {
    let tool_call = ToolCall {
        id: "t1".into(),
        name: "calc__add".into(),
        arguments: [
            ("a".to_string(), serde_json::json!(2)),
            ("b".to_string(), serde_json::json!(3)),
        ]
        .into_iter()
        .collect(),
    };
    let first = LlmReply {
        content: String::new(),
        tool_calls: vec![tool_call],
        ..LlmReply::default()
    };
    let mcp = McpClientManager::connect_all(&scripted_mcp_config()).await;
    assert_eq!(mcp.server_count(), 1);

    let harness = Harness::new(
        "tooluse",
        vec![first, LlmReply::text("The answer is 5.")],
        verification_off(),
        mcp,
    )
    .await;

    let mut rx = harness.sse.register("c1").await;
    harness.send("c1", "what is 2 plus 3").await;
    harness.wait_idle().await;

    let rendered = recv_message_event(&mut rx).await;
    assert!(rendered.contains("The answer is 5."));

    // History: user, assistant(empty), tool(t1, "5"), assistant(final).
    let messages = harness.history.get_messages("web", "c1", 10).await.unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "");
    // The assistant turn keeps its call, so replaying this history later
    // still pairs the tool result with it.
    assert_eq!(messages[1].tool_calls.len(), 1);
    assert_eq!(messages[1].tool_calls[0].id, "t1");
    assert_eq!(messages[1].tool_calls[0].name, "calc__add");
    assert_eq!(messages[2].role, Role::Tool);
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("t1"));
    assert_eq!(messages[2].content, "5");
    assert_eq!(messages[3].role, Role::Assistant);
    assert_eq!(messages[3].content, "The answer is 5.");

    let timeline = harness.journal_timeline("c1").await;
    assert!(timeline
        .iter()
        .any(|e| e.event == JournalEvent::ToolCallStarted));
    assert!(timeline
        .iter()
        .any(|e| e.event == JournalEvent::ToolCallCompleted));

    harness.cleanup();
}

// --- Tool loop termination bound ---

#[tokio::test]
async fn tool_loop_is_bounded() {
    // Every scripted reply requests another (unknown) tool; the loop must cap
    // at MAX_TOOL_ITERATIONS calls plus one final no-tools call.
    let looping: Vec<LlmReply> = (0..20)
        .map(|i| LlmReply {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("t{i}"),
                name: "ghost__tool".into(),
                arguments: Default::default(),
            }],
            ..LlmReply::default()
        })
        .collect();

    let harness = Harness::new(
        "bounded",
        looping,
        verification_off(),
        McpClientManager::new(),
    )
    .await;

    harness.send("c1", "loop forever please").await;
    harness.wait_idle().await;

    assert_eq!(
        harness.backend.calls.load(Ordering::SeqCst),
        11,
        "10 iterations + 1 final no-tools call"
    );

    // The unknown tool surfaced as an inline error, not a task failure.
    let messages = harness.history.get_messages("web", "c1", 50).await.unwrap();
    assert!(messages
        .iter()
        .any(|m| m.role == Role::Tool && m.content.contains("Tool error")));

    harness.cleanup();
}

// --- Verification retry bound ---

#[tokio::test]
async fn verification_retries_are_bounded() {
    // The model returns an empty response forever; REDO every attempt.
    let harness = Harness::new(
        "vbound",
        vec![
            LlmReply::text(""),
            LlmReply::text(""),
            LlmReply::text(""),
            LlmReply::text(""),
        ],
        verification_on(),
        McpClientManager::new(),
    )
    .await;

    harness.send("c1", "say something substantial").await;
    harness.wait_idle().await;

    // 1 initial + max_retries (3) regenerations.
    assert_eq!(harness.backend.calls.load(Ordering::SeqCst), 4);

    let timeline = harness.journal_timeline("c1").await;
    let verdicts = timeline
        .iter()
        .filter(|e| e.event == JournalEvent::VerificationResult)
        .count();
    assert_eq!(verdicts, 3, "at most max_retries verifier invocations");

    // Exhausted retries still deliver (the last candidate).
    assert!(timeline
        .iter()
        .any(|e| e.event == JournalEvent::ResponseSent));

    harness.cleanup();
}

// --- Short-response verification skip ---

#[tokio::test]
async fn short_responses_skip_verification() {
    let short = "x".repeat(49);
    let config = VerificationConfig {
        enabled: true,
        ..VerificationConfig::default()
    };
    let harness = Harness::new(
        "vskip",
        vec![LlmReply::text(short)],
        config,
        McpClientManager::new(),
    )
    .await;

    harness.send("c1", "tell me something brief").await;
    harness.wait_idle().await;

    let timeline = harness.journal_timeline("c1").await;
    assert!(timeline
        .iter()
        .all(|e| e.event != JournalEvent::VerificationStarted));

    harness.cleanup();
}

// --- Content-based skill dispatch ---

#[tokio::test]
async fn content_skill_runs_one_completion() {
    let harness = Harness::new(
        "contentskill",
        vec![LlmReply::text("HELLO WORLD")],
        verification_off(),
        McpClientManager::new(),
    )
    .await;
    harness.skills.register(Skill {
        instructions: Some("Uppercase this: $ARGUMENTS".into()),
        disable_model_invocation: false,
        ..Skill::builtin("shout", "Uppercase text")
    });

    let mut rx = harness.sse.register("c1").await;
    harness.send("c1", "/shout hello world").await;
    harness.wait_idle().await;

    let rendered = recv_message_event(&mut rx).await;
    assert!(rendered.contains("HELLO WORLD"));

    // One completion, no full pipeline.
    assert_eq!(harness.backend.calls.load(Ordering::SeqCst), 1);
    let timeline = harness.journal_timeline("c1").await;
    assert!(timeline
        .iter()
        .any(|e| e.event == JournalEvent::SkillDispatched));
    assert!(timeline
        .iter()
        .all(|e| e.event != JournalEvent::PipelineStarted));
    // No history writes for content-skill dispatch.
    assert!(harness
        .history
        .get_messages("web", "c1", 10)
        .await
        .unwrap()
        .is_empty());

    harness.cleanup();
}

// --- Unknown slash command falls through to the pipeline ---

#[tokio::test]
async fn unknown_slash_command_goes_to_pipeline() {
    let harness = Harness::new(
        "unknowncmd",
        vec![LlmReply::text("That's not a command I know.")],
        verification_off(),
        McpClientManager::new(),
    )
    .await;

    harness.send("c1", "/frobnicate now").await;
    harness.wait_idle().await;

    let timeline = harness.journal_timeline("c1").await;
    assert!(timeline
        .iter()
        .any(|e| e.event == JournalEvent::PipelineStarted));

    harness.cleanup();
}

// --- /retry resends the recorded last response ---

#[tokio::test]
async fn retry_resends_last_response() {
    let harness = Harness::new(
        "retry",
        vec![LlmReply::text("First answer.")],
        verification_off(),
        McpClientManager::new(),
    )
    .await;

    harness.send("c1", "question one").await;
    harness.wait_idle().await;

    let mut rx = harness.sse.register("c1").await;
    harness.send("c1", "/retry").await;
    let event = rx.try_recv().expect("synchronous retry reply");
    assert!(format!("{event:?}").contains("First answer."));

    harness.cleanup();
}

// --- Per-conversation serialisation under concurrent messages ---

#[tokio::test]
async fn concurrent_messages_keep_history_contiguous() {
    let replies: Vec<LlmReply> = (0..8).map(|i| LlmReply::text(format!("reply {i}"))).collect();
    let harness = Harness::new(
        "concurrent",
        replies,
        verification_off(),
        McpClientManager::new(),
    )
    .await;

    for i in 0..8 {
        harness.send("c1", &format!("message {i}")).await;
    }
    harness.wait_idle().await;

    // 8 user + 8 assistant entries with a contiguous seq range.
    let messages = harness.history.get_messages("web", "c1", 100).await.unwrap();
    assert_eq!(messages.len(), 16);
    for (i, entry) in messages.iter().enumerate() {
        assert_eq!(entry.seq, (i + 1) as u64, "seq must be gapless");
    }
    let index = harness.history.index("web", "c1").await.unwrap();
    assert_eq!(index.next_seq, 17);
    assert_eq!(index.segments[0].first_seq, 1);

    harness.cleanup();
}
