//! The full conversation pipeline: history append, tool-use loop,
//! verification, and delivery, with crash-safe phase tracking.
//!
//! History reads and writes are bracketed by the conversation mutex; the
//! mutex is never held across LLM calls, tool calls, or verification.

use super::verify::{self, Rating};
use super::AgentService;
use switchboard_core::chat::{ChatMessage, Role, ToolDefinition};
use switchboard_core::error::HostError;
use switchboard_core::message::NormalizedMessage;
use switchboard_store::{HistoryAppend, JournalEvent, TaskPhase};
use tracing::{info, warn};

impl AgentService {
    /// Run the full pipeline for one normal conversation message.
    pub(crate) async fn run_pipeline(
        &self,
        message: &NormalizedMessage,
        task_id: &str,
    ) -> Result<(), HostError> {
        let key = message.conversation_key();
        let store = self.tasks.store().clone();

        self.journal
            .record(
                JournalEvent::PipelineStarted,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::Value::Null,
            )
            .await;

        // --- a/b: append the user message, read the snapshot (under lock) ---
        let snapshot = {
            let _guard = self.locks.acquire(&key).await;
            self.history
                .append(
                    &message.channel_id,
                    &message.conversation_id,
                    HistoryAppend {
                        role: Role::User,
                        content: message.text.clone(),
                        sender_id: Some(message.sender_id.clone()),
                        platform_message_id: message.platform_message_id.clone(),
                        task_id: Some(task_id.to_string()),
                        ..HistoryAppend::default()
                    },
                )
                .await?;
            self.journal
                .record(
                    JournalEvent::HistoryAppended,
                    task_id,
                    &message.channel_id,
                    &message.conversation_id,
                    serde_json::json!({"role": "user"}),
                )
                .await;
            if let Err(e) = store
                .update_phase(task_id, TaskPhase::HistoryWritten, None, None)
                .await
            {
                warn!("task {task_id}: phase update failed: {e}");
            }
            self.history
                .get_messages(
                    &message.channel_id,
                    &message.conversation_id,
                    self.config.history.max_messages,
                )
                .await?
        };

        // --- c: build the transcript and tool catalogue ---
        let mut messages: Vec<ChatMessage> =
            vec![ChatMessage::system(&self.config.persona.system_prompt)];
        // Replay keeps assistant-side tool calls paired with their results;
        // native backends reject an unpaired tool-role message.
        for entry in &snapshot {
            messages.push(ChatMessage {
                role: entry.role,
                content: entry.content.clone(),
                tool_call_id: entry.tool_call_id.clone(),
                tool_calls: entry.tool_calls.clone(),
            });
        }
        let mut tools: Vec<ToolDefinition> = self.mcp.all_tools();
        tools.extend(self.skills.skill_tools());

        self.journal
            .record(
                JournalEvent::LlmCallStarted,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::json!({"tools": tools.len()}),
            )
            .await;
        if let Err(e) = store
            .update_phase(task_id, TaskPhase::LlmCalling, None, None)
            .await
        {
            warn!("task {task_id}: phase update failed: {e}");
        }

        // --- d: tool-use loop ---
        let mut response = self.tool_loop(message, task_id, messages.clone(), &tools).await?;

        // --- e: verification ---
        let vconfig = self.effective_verification(&message.channel_id);
        if verify::should_verify(&message.text, &response, &vconfig) {
            if let Err(e) = store
                .update_phase(task_id, TaskPhase::Verifying, Some(response.clone()), None)
                .await
            {
                warn!("task {task_id}: phase update failed: {e}");
            }
            response = self
                .verification_loop(message, task_id, &messages, &tools, response, &vconfig)
                .await?;
        }

        // --- f: append the assistant message (under lock) ---
        {
            let _guard = self.locks.acquire(&key).await;
            self.history
                .append(
                    &message.channel_id,
                    &message.conversation_id,
                    HistoryAppend {
                        role: Role::Assistant,
                        content: response.clone(),
                        task_id: Some(task_id.to_string()),
                        ..HistoryAppend::default()
                    },
                )
                .await?;
            self.journal
                .record(
                    JournalEvent::HistoryAppended,
                    task_id,
                    &message.channel_id,
                    &message.conversation_id,
                    serde_json::json!({"role": "assistant"}),
                )
                .await;
        }
        if let Err(e) = store
            .update_phase(task_id, TaskPhase::Responding, Some(response.clone()), None)
            .await
        {
            warn!("task {task_id}: phase update failed: {e}");
        }

        // --- g: remember the response for /retry ---
        self.last_responses
            .lock()
            .await
            .insert(key.clone(), response.clone());

        // --- h: deliver ---
        let channel = self
            .channels
            .get(&message.channel_id)
            .ok_or_else(|| HostError::Channel(format!("no channel {}", message.channel_id)))?;
        channel
            .send_message(
                &message.conversation_id,
                switchboard_core::message::OutgoingMessage::reply(
                    response,
                    message.platform_message_id.clone(),
                ),
            )
            .await?;
        self.journal
            .record(
                JournalEvent::ResponseSent,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::Value::Null,
            )
            .await;
        self.journal
            .record(
                JournalEvent::TaskCompleted,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::Value::Null,
            )
            .await;

        info!("task {task_id}: pipeline completed");
        Ok(())
    }

    /// Verification loop: up to `max_retries` verifier passes, regenerating
    /// after each failure. Exhausting retries delivers the last candidate.
    pub(crate) async fn verification_loop(
        &self,
        message: &NormalizedMessage,
        task_id: &str,
        base_messages: &[ChatMessage],
        tools: &[ToolDefinition],
        mut current: String,
        vconfig: &switchboard_core::config::VerificationConfig,
    ) -> Result<String, HostError> {
        let store = self.tasks.store().clone();
        self.journal
            .record(
                JournalEvent::VerificationStarted,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::Value::Null,
            )
            .await;

        let mut feedback_log: Vec<String> = Vec::new();
        for attempt in 1..=vconfig.max_retries {
            let verdict = self.composite_verdict(&message.text, &current, vconfig).await;
            self.journal
                .record(
                    JournalEvent::VerificationResult,
                    task_id,
                    &message.channel_id,
                    &message.conversation_id,
                    serde_json::json!({
                        "attempt": attempt,
                        "rating": verdict.rating.as_str(),
                        "passed": verdict.passed,
                        "confidence": verdict.confidence,
                    }),
                )
                .await;
            if verdict.passed {
                return Ok(current);
            }

            feedback_log.push(verdict.feedback.clone());
            let regen_messages = match verdict.rating {
                Rating::Redo => {
                    // Rebuild from scratch with the system prompt augmented
                    // by all accumulated feedback.
                    let mut msgs = base_messages.to_vec();
                    if let Some(system) = msgs.iter_mut().find(|m| m.role == Role::System) {
                        system.content.push_str(&format!(
                            "\n\nYour previous attempt was rejected. Feedback:\n- {}",
                            feedback_log.join("\n- ")
                        ));
                    }
                    msgs
                }
                _ => {
                    // NEEDS_FIX: extend the transcript with the candidate and
                    // a synthetic user turn stating the required fixes.
                    let mut msgs = base_messages.to_vec();
                    msgs.push(ChatMessage::assistant(current.clone()));
                    msgs.push(ChatMessage::user(format!(
                        "Please revise your previous response. Required fixes: {}",
                        verdict.feedback
                    )));
                    msgs
                }
            };

            current = self.tool_loop(message, task_id, regen_messages, tools).await?;
            if let Err(e) = store
                .update_phase(task_id, TaskPhase::Verifying, Some(current.clone()), None)
                .await
            {
                warn!("task {task_id}: phase update failed: {e}");
            }
        }

        Ok(current)
    }

    /// Composite verifier: sub-verifiers in order, first failure wins;
    /// absence of failure is a full-confidence pass.
    pub(crate) async fn composite_verdict(
        &self,
        request: &str,
        response: &str,
        vconfig: &switchboard_core::config::VerificationConfig,
    ) -> verify::Verdict {
        if vconfig.rules.enabled {
            let verdict = verify::rule_verdict(request, response);
            if !verdict.passed {
                return verdict;
            }
        }
        if vconfig.llm_review.enabled {
            let reviewer = self.review_llm.as_ref().unwrap_or(&self.llm);
            let verdict =
                verify::llm_verdict(reviewer, request, response, vconfig.confidence_threshold)
                    .await;
            if !verdict.passed {
                return verdict;
            }
        }
        verify::Verdict::pass()
    }
}
