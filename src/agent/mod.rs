//! Agent service — the per-message pipeline entry point.
//!
//! Classifies each inbound message (slash command vs. normal conversation),
//! dispatches builtin skills synchronously, and submits everything else as a
//! background task through the task manager.

mod pipeline;
mod tool_loop;
pub mod verify;

use crate::convlock::ConversationMutex;
use crate::tasks::TaskManager;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;
use switchboard_channels::ChannelManager;
use switchboard_core::config::{Config, VerificationConfig};
use switchboard_core::message::{NormalizedMessage, OutgoingMessage};
use switchboard_core::traits::MessageHandler;
use switchboard_llm::LlmService;
use switchboard_mcp::McpClientManager;
use switchboard_skills::{
    parse_slash_command, substitute_arguments, SkillContext, SkillOutcome, SkillRegistry,
    SkillSource,
};
use switchboard_store::{HistoryStore, Journal, JournalEvent};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct AgentService {
    pub(crate) config: Config,
    pub(crate) history: HistoryStore,
    pub(crate) journal: Journal,
    pub(crate) llm: LlmService,
    pub(crate) review_llm: Option<LlmService>,
    pub(crate) mcp: Arc<McpClientManager>,
    pub(crate) skills: Arc<SkillRegistry>,
    pub(crate) channels: Arc<ChannelManager>,
    pub(crate) tasks: Arc<TaskManager>,
    pub(crate) locks: ConversationMutex,
    /// (channelId:conversationId) → last delivered response, for `/retry`.
    pub(crate) last_responses: Mutex<HashMap<String, String>>,
    pub(crate) started: Instant,
}

impl AgentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        history: HistoryStore,
        journal: Journal,
        llm: LlmService,
        review_llm: Option<LlmService>,
        mcp: Arc<McpClientManager>,
        skills: Arc<SkillRegistry>,
        channels: Arc<ChannelManager>,
        tasks: Arc<TaskManager>,
    ) -> Arc<Self> {
        let agent = Arc::new(Self {
            config,
            history,
            journal,
            llm,
            review_llm,
            mcp,
            skills,
            channels,
            tasks,
            locks: ConversationMutex::new(),
            last_responses: Mutex::new(HashMap::new()),
            started: Instant::now(),
        });
        agent.install_builtin_executors();
        agent
    }

    /// The single process-wide inbound handler, registered on every channel.
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let agent = self.clone();
        Arc::new(move |message| {
            let agent = agent.clone();
            async move {
                agent.handle_message(message).await;
            }
            .boxed()
        })
    }

    /// Classify and dispatch one inbound message.
    pub async fn handle_message(self: &Arc<Self>, message: NormalizedMessage) {
        if message.text.trim().is_empty() {
            info!("dropping empty message from {}", message.sender_id);
            return;
        }

        let preview: String = message.text.chars().take(60).collect();
        info!(
            "[{}] {} says: {preview}",
            message.channel_id,
            message.sender_name.as_deref().unwrap_or("unknown")
        );

        // --- Slash dispatch ---
        if let Some((name, args)) = parse_slash_command(&message.text) {
            if let Some(skill) = self.skills.get(&name) {
                if skill.user_invocable {
                    self.journal
                        .record(
                            JournalEvent::SkillDispatched,
                            &message.id.to_string(),
                            &message.channel_id,
                            &message.conversation_id,
                            serde_json::json!({"skill": name, "source": match skill.source {
                                SkillSource::Builtin => "builtin",
                                SkillSource::SkillMd => "skillmd",
                            }}),
                        )
                        .await;

                    if let Some(executor) = skill.executor.clone() {
                        // Builtin: run in-process, reply synchronously,
                        // never through the task manager.
                        let outcome = executor(SkillContext {
                            channel_id: message.channel_id.clone(),
                            conversation_id: message.conversation_id.clone(),
                            sender_id: message.sender_id.clone(),
                            args,
                        })
                        .await;
                        if outcome.handled {
                            self.send_reply(&message, &outcome.text).await;
                        }
                        return;
                    }

                    if let Some(instructions) = skill.instructions.clone() {
                        // Content-based skill: one completion as a background task.
                        let agent = self.clone();
                        let raw_text = message.text.clone();
                        self.tasks
                            .submit(message, move |msg, task_id| async move {
                                agent
                                    .run_content_skill(&msg, &task_id, &instructions, &args, &raw_text)
                                    .await
                            })
                            .await;
                        return;
                    }

                    warn!("skill {name} has neither executor nor instructions");
                    return;
                }
            }
        }

        // --- Normal conversation ---
        let agent = self.clone();
        self.tasks
            .submit(message, move |msg, task_id| async move {
                agent.run_pipeline(&msg, &task_id).await
            })
            .await;
    }

    /// One-shot content-skill completion: the skill's instructions (with
    /// `$ARGUMENTS` substituted) as system prompt, the raw message text as
    /// user prompt.
    async fn run_content_skill(
        &self,
        message: &NormalizedMessage,
        task_id: &str,
        instructions: &str,
        args: &str,
        raw_text: &str,
    ) -> Result<(), switchboard_core::error::HostError> {
        let system = substitute_arguments(instructions, args);
        self.journal
            .record(
                JournalEvent::LlmCallStarted,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::json!({"kind": "content_skill"}),
            )
            .await;
        let text = self.llm.complete(&system, raw_text).await?;
        self.journal
            .record(
                JournalEvent::LlmCallCompleted,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::Value::Null,
            )
            .await;
        self.send_reply(message, &text).await;
        self.journal
            .record(
                JournalEvent::ResponseSent,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::Value::Null,
            )
            .await;
        Ok(())
    }

    /// Reply to the sender, threading onto the platform message when possible.
    pub(crate) async fn send_reply(&self, message: &NormalizedMessage, text: &str) {
        let Some(channel) = self.channels.get(&message.channel_id) else {
            warn!("no channel {} for reply", message.channel_id);
            return;
        };
        let reply = OutgoingMessage::reply(text, message.platform_message_id.clone());
        if let Err(e) = channel.send_message(&message.conversation_id, reply).await {
            warn!("reply via {} failed: {e}", message.channel_id);
        }
    }

    /// Per-channel verification override, else the global config.
    pub(crate) fn effective_verification(&self, channel_id: &str) -> VerificationConfig {
        self.config
            .channels
            .get(channel_id)
            .and_then(|c| c.verification.clone())
            .unwrap_or_else(|| self.config.verification.clone())
    }

    /// Install the builtin slash-command executors. Builtins are registered
    /// without executors at startup; the agent installs them here because
    /// they need the agent's own dependencies (late binding).
    fn install_builtin_executors(self: &Arc<Self>) {
        self.install_executor("help", |agent, _ctx| async move {
            let mut lines = vec!["Available commands:".to_string()];
            for skill in agent.skills.list() {
                if !skill.user_invocable {
                    continue;
                }
                let hint = skill
                    .argument_hint
                    .as_deref()
                    .map(|h| format!(" {h}"))
                    .unwrap_or_default();
                lines.push(format!("/{}{hint} — {}", skill.name, skill.description));
            }
            done(lines.join("\n"))
        });

        self.install_executor("status", |agent, _ctx| async move {
            let statuses = agent.channels.statuses().await;
            let channel_lines: Vec<String> = statuses
                .iter()
                .map(|c| {
                    format!(
                        "  {} ({}): {:?}{}",
                        c.id,
                        c.kind.as_str(),
                        c.status,
                        c.error.as_deref().map(|e| format!(" — {e}")).unwrap_or_default()
                    )
                })
                .collect();
            let text = format!(
                "Backend: {}\nUptime: {}s\nActive tasks: {}\nChannels:\n{}",
                agent.llm.backend_name(),
                agent.started.elapsed().as_secs(),
                agent.tasks.active_count().await,
                channel_lines.join("\n"),
            );
            done(text)
        });

        self.install_executor("skills", |agent, _ctx| async move {
            let mut lines = vec!["Loaded skills:".to_string()];
            for skill in agent.skills.list() {
                let tag = match skill.source {
                    SkillSource::Builtin => "builtin",
                    SkillSource::SkillMd => "skill.md",
                };
                lines.push(format!("- {} [{tag}]: {}", skill.name, skill.description));
            }
            done(lines.join("\n"))
        });

        self.install_executor("history", |agent, ctx| async move {
            let entries = match agent
                .history
                .get_messages(&ctx.channel_id, &ctx.conversation_id, 10)
                .await
            {
                Ok(entries) => entries,
                Err(e) => return done(format!("Could not read history: {e}")),
            };
            if entries.is_empty() {
                return done("No history yet.".to_string());
            }
            let lines: Vec<String> = entries
                .iter()
                .map(|e| {
                    let preview: String = e.content.chars().take(80).collect();
                    format!("{}. [{}] {preview}", e.seq, e.role.as_str())
                })
                .collect();
            done(lines.join("\n"))
        });

        self.install_executor("clear", |agent, ctx| async move {
            match agent
                .history
                .clear(&ctx.channel_id, &ctx.conversation_id)
                .await
            {
                Ok(()) => done("Conversation history cleared.".to_string()),
                Err(e) => done(format!("Could not clear history: {e}")),
            }
        });

        self.install_executor("retry", |agent, ctx| async move {
            let key = format!("{}:{}", ctx.channel_id, ctx.conversation_id);
            let last = agent.last_responses.lock().await.get(&key).cloned();
            match last {
                Some(text) => done(text),
                None => done("No previous response to retry.".to_string()),
            }
        });
    }

    /// Wire one executor closure through a weak reference: the registry is
    /// owned by the agent, so a strong capture would cycle.
    fn install_executor<F, Fut>(self: &Arc<Self>, name: &str, run: F)
    where
        F: Fn(Arc<AgentService>, SkillContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = SkillOutcome> + Send + 'static,
    {
        let weak: Weak<AgentService> = Arc::downgrade(self);
        let run = Arc::new(run);
        self.skills.install_executor(
            name,
            Arc::new(move |ctx| {
                let weak = weak.clone();
                let run = run.clone();
                async move {
                    match weak.upgrade() {
                        Some(agent) => run(agent, ctx).await,
                        None => SkillOutcome {
                            text: "Host is shutting down.".to_string(),
                            handled: true,
                        },
                    }
                }
                .boxed()
            }),
        );
    }
}

fn done(text: String) -> SkillOutcome {
    SkillOutcome {
        text,
        handled: true,
    }
}
