//! The bounded tool-use loop.
//!
//! Per iteration the LLM sees the current transcript plus the tool catalogue.
//! Tool calls are executed (skill tools as nested completions, everything
//! else through the MCP manager), results are fed back as `tool` messages,
//! and the loop ends on the first plain response. After `MAX_TOOL_ITERATIONS`
//! the model gets one final call without tools, so the loop makes at most
//! `MAX_TOOL_ITERATIONS + 1` LLM calls per loop. Tool errors never abort the
//! loop; they are inlined into the tool result.

use super::AgentService;
use switchboard_core::chat::{ChatMessage, Role, ToolCall, ToolDefinition};
use switchboard_core::error::HostError;
use switchboard_core::message::NormalizedMessage;
use switchboard_skills::substitute_arguments;
use switchboard_store::{HistoryAppend, JournalEvent};
use tracing::{debug, info};

/// Iteration bound before the no-tools fallback call.
pub(crate) const MAX_TOOL_ITERATIONS: u32 = 10;

impl AgentService {
    pub(crate) async fn tool_loop(
        &self,
        message: &NormalizedMessage,
        task_id: &str,
        mut messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> Result<String, HostError> {
        for iteration in 0..MAX_TOOL_ITERATIONS {
            let reply = self.llm.chat(&messages, tools).await?;

            if reply.tool_calls.is_empty() {
                self.journal
                    .record(
                        JournalEvent::LlmCallCompleted,
                        task_id,
                        &message.channel_id,
                        &message.conversation_id,
                        serde_json::json!({"model": reply.model, "iterations": iteration + 1}),
                    )
                    .await;
                return Ok(reply.content);
            }

            // Synthetic assistant message carrying the free text (possibly
            // empty) AND the tool calls it made: native backends reject a
            // tool result whose originating call is missing from the
            // transcript. Persisted too, so the pairing survives a crash
            // mid-loop and later turns replay cleanly.
            messages.push(ChatMessage::assistant_with_tools(
                reply.content.clone(),
                reply.tool_calls.clone(),
            ));
            self.append_loop_entry(
                message,
                task_id,
                HistoryAppend {
                    role: Role::Assistant,
                    content: reply.content.clone(),
                    tool_calls: reply.tool_calls.clone(),
                    ..HistoryAppend::default()
                },
            )
            .await?;

            for call in &reply.tool_calls {
                info!("task {task_id}: tool call {} ({})", call.name, call.id);
                self.journal
                    .record(
                        JournalEvent::ToolCallStarted,
                        task_id,
                        &message.channel_id,
                        &message.conversation_id,
                        serde_json::json!({"tool": call.name, "callId": call.id}),
                    )
                    .await;

                let result = self.execute_tool(call).await;

                self.journal
                    .record(
                        JournalEvent::ToolCallCompleted,
                        task_id,
                        &message.channel_id,
                        &message.conversation_id,
                        serde_json::json!({"tool": call.name, "callId": call.id}),
                    )
                    .await;
                self.append_loop_entry(
                    message,
                    task_id,
                    HistoryAppend {
                        role: Role::Tool,
                        content: result.clone(),
                        tool_call_id: Some(call.id.clone()),
                        ..HistoryAppend::default()
                    },
                )
                .await?;
                messages.push(ChatMessage::tool(result, call.id.clone()));
            }
        }

        // Bound reached: one final call without tools.
        debug!("task {task_id}: tool loop exhausted, final call without tools");
        let reply = self.llm.chat(&messages, &[]).await?;
        self.journal
            .record(
                JournalEvent::LlmCallCompleted,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::json!({"model": reply.model, "exhausted": true}),
            )
            .await;
        Ok(reply.content)
    }

    /// Persist one intermediate loop turn under the conversation mutex.
    async fn append_loop_entry(
        &self,
        message: &NormalizedMessage,
        task_id: &str,
        entry: HistoryAppend,
    ) -> Result<(), HostError> {
        let key = message.conversation_key();
        let _guard = self.locks.acquire(&key).await;
        self.history
            .append(
                &message.channel_id,
                &message.conversation_id,
                HistoryAppend {
                    task_id: Some(task_id.to_string()),
                    ..entry
                },
            )
            .await?;
        Ok(())
    }

    /// Execute one tool call. Never fails; failures become the tool result.
    async fn execute_tool(&self, call: &ToolCall) -> String {
        if let Some(skill_name) = call.name.strip_prefix("skill__") {
            let Some(skill) = self.skills.get(skill_name) else {
                return format!("Skill {skill_name} not found");
            };
            let Some(instructions) = skill.instructions else {
                return format!("Skill {skill_name} not found");
            };
            let args = call.str_arg("arguments");
            let system = substitute_arguments(&instructions, &args);
            match self.llm.complete(&system, &args).await {
                Ok(text) => text,
                Err(e) => format!("Tool error: {e}"),
            }
        } else {
            let arguments = serde_json::to_value(&call.arguments)
                .unwrap_or(serde_json::Value::Object(Default::default()));
            match self.mcp.invoke_tool(&call.name, arguments).await {
                Ok(text) => text,
                Err(e) => format!("Tool error: {e}"),
            }
        }
    }
}
