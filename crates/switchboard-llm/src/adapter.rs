//! Completion→chat adapter.
//!
//! Adapts a [`CompletionBackend`] to the chat interface: the transcript is
//! flattened into one prompt (`[role]` sections, tool results prefixed
//! `[Tool Result]`), the tool catalogue is serialised into the system prompt
//! with instructions to answer with `{"tool_call": {"name": ..., "arguments":
//! {...}}}`, and the response text is scanned for the first JSON object of
//! that shape. A legacy compatibility shim; backends that surface tool calls
//! natively are preferred.

use crate::{CompletionBackend, LlmBackend};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use switchboard_core::chat::{ChatMessage, LlmReply, Role, ToolCall, ToolDefinition};
use switchboard_core::error::HostError;
use uuid::Uuid;

/// Wraps a completion-only backend into the chat contract.
pub struct CompletionAdapter<B: CompletionBackend> {
    inner: B,
}

impl<B: CompletionBackend> CompletionAdapter<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }
}

/// Flatten a chat transcript into a single prompt string.
pub(crate) fn flatten_messages(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        match msg.role {
            Role::Tool => {
                out.push_str("[Tool Result]\n");
                out.push_str(&msg.content);
            }
            role => {
                out.push('[');
                out.push_str(role.as_str());
                out.push_str("]\n");
                out.push_str(&msg.content);
            }
        }
    }
    out
}

/// Append the tool catalogue and calling convention to a system prompt.
pub(crate) fn tool_instructions(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(
        "\n\nYou can call the following tools. To call one, respond with ONLY a JSON \
         object of the form {\"tool_call\": {\"name\": \"<tool>\", \"arguments\": {...}}} \
         and nothing else.\n\nTools:\n",
    );
    for tool in tools {
        out.push_str(&format!(
            "- {}: {}\n  input schema: {}\n",
            tool.name,
            tool.description,
            serde_json::to_string(&tool.input_schema).unwrap_or_default()
        ));
    }
    out
}

#[derive(Deserialize)]
struct EmbeddedCall {
    tool_call: EmbeddedCallBody,
}

#[derive(Deserialize)]
struct EmbeddedCallBody {
    name: String,
    #[serde(default)]
    arguments: HashMap<String, serde_json::Value>,
}

/// Scan text for the first JSON object matching the tool-call shape.
pub(crate) fn extract_tool_call(text: &str) -> Option<(String, HashMap<String, serde_json::Value>)> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = balanced_object_end(text, i) {
                let candidate = &text[i..=end];
                if let Ok(call) = serde_json::from_str::<EmbeddedCall>(candidate) {
                    return Some((call.tool_call.name, call.tool_call.arguments));
                }
            }
        }
        i += 1;
    }
    None
}

/// Index of the `}` closing the object opened at `start`, honouring strings
/// and escapes.
fn balanced_object_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[async_trait]
impl<B: CompletionBackend> LlmBackend for CompletionAdapter<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmReply, HostError> {
        let mut flattened: Vec<ChatMessage> = messages.to_vec();
        if !tools.is_empty() {
            // Fold the tool convention into the system message (prepending
            // one if the transcript has none).
            match flattened.iter_mut().find(|m| m.role == Role::System) {
                Some(system) => system.content.push_str(&tool_instructions(tools)),
                None => flattened.insert(0, ChatMessage::system(tool_instructions(tools))),
            }
        }

        let prompt = flatten_messages(&flattened);
        let (text, model) = self.inner.complete(&prompt).await?;

        let mut reply = LlmReply {
            content: text,
            model,
            usage: None,
            tool_calls: Vec::new(),
        };

        if !tools.is_empty() {
            if let Some((name, arguments)) = extract_tool_call(&reply.content) {
                reply.tool_calls.push(ToolCall {
                    id: format!("call_{}", Uuid::new_v4().simple()),
                    name,
                    arguments,
                });
                reply.content = String::new();
            }
        }

        Ok(reply)
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted completion backend that records prompts and replays canned
    /// responses.
    struct StubCompletion {
        prompts: Mutex<Vec<String>>,
        responses: Mutex<Vec<String>>,
    }

    impl StubCompletion {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                prompts: Mutex::new(Vec::new()),
                responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl CompletionBackend for StubCompletion {
        fn name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, prompt: &str) -> Result<(String, Option<String>), HostError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| "done".to_string());
            Ok((next, None))
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn calc_tool() -> ToolDefinition {
        ToolDefinition {
            name: "calc__add".into(),
            description: "Add two numbers".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn test_flatten_roles_and_tool_results() {
        let prompt = flatten_messages(&[
            ChatMessage::system("Be terse."),
            ChatMessage::user("add"),
            ChatMessage::assistant(""),
            ChatMessage::tool("5", "t1"),
        ]);
        assert!(prompt.starts_with("[system]\nBe terse."));
        assert!(prompt.contains("[user]\nadd"));
        assert!(prompt.contains("[Tool Result]\n5"));
    }

    #[test]
    fn test_extract_tool_call_basic() {
        let (name, args) =
            extract_tool_call(r#"{"tool_call": {"name": "calc__add", "arguments": {"a": 2}}}"#)
                .unwrap();
        assert_eq!(name, "calc__add");
        assert_eq!(args.get("a"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_extract_tool_call_embedded_in_prose() {
        let text = r#"Sure, I'll use a tool: {"tool_call": {"name": "t__x", "arguments": {}}} done"#;
        let (name, _) = extract_tool_call(text).unwrap();
        assert_eq!(name, "t__x");
    }

    #[test]
    fn test_extract_ignores_non_matching_objects() {
        assert!(extract_tool_call(r#"{"answer": 42} and {"also": "no"}"#).is_none());
        assert!(extract_tool_call("no json here").is_none());
    }

    #[test]
    fn test_extract_handles_braces_in_strings() {
        let text = r#"{"tool_call": {"name": "echo", "arguments": {"text": "a { tricky } string"}}}"#;
        let (name, args) = extract_tool_call(text).unwrap();
        assert_eq!(name, "echo");
        assert_eq!(
            args.get("text"),
            Some(&serde_json::json!("a { tricky } string"))
        );
    }

    #[tokio::test]
    async fn test_adapter_synthesises_tool_call() {
        let stub = StubCompletion::new(vec![
            r#"{"tool_call": {"name": "calc__add", "arguments": {"a": 2, "b": 3}}}"#,
        ]);
        let adapter = CompletionAdapter::new(stub);
        let reply = adapter
            .chat(&[ChatMessage::user("add 2 and 3")], &[calc_tool()])
            .await
            .unwrap();
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "calc__add");
        assert!(reply.tool_calls[0].id.starts_with("call_"));
        assert!(reply.content.is_empty());
    }

    #[tokio::test]
    async fn test_adapter_injects_catalogue_into_system() {
        let stub = StubCompletion::new(vec!["plain answer"]);
        let adapter = CompletionAdapter::new(stub);
        let reply = adapter
            .chat(
                &[ChatMessage::system("Persona."), ChatMessage::user("hi")],
                &[calc_tool()],
            )
            .await
            .unwrap();
        assert_eq!(reply.content, "plain answer");
        let prompts = adapter.inner.prompts.lock().unwrap();
        assert!(prompts[0].contains("Persona."));
        assert!(prompts[0].contains("calc__add"));
        assert!(prompts[0].contains("\"tool_call\""));
    }

    #[tokio::test]
    async fn test_adapter_without_tools_passes_text_through() {
        let stub = StubCompletion::new(vec![r#"{"tool_call": {"name": "x", "arguments": {}}}"#]);
        let adapter = CompletionAdapter::new(stub);
        let reply = adapter.chat(&[ChatMessage::user("hi")], &[]).await.unwrap();
        // No tools offered, so no extraction; text passes through verbatim.
        assert!(reply.tool_calls.is_empty());
        assert!(reply.content.contains("tool_call"));
    }
}
