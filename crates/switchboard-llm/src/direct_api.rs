//! OpenAI-compatible chat-completions backend.
//!
//! Works with OpenAI's API and any compatible endpoint; surfaces tool calls
//! natively from the `tool_calls` field.

use crate::LlmBackend;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use switchboard_core::chat::{ChatMessage, LlmReply, Role, ToolCall, ToolDefinition, Usage};
use switchboard_core::error::HostError;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible HTTP backend.
pub struct DirectApiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: Option<u32>,
}

impl DirectApiBackend {
    pub fn new(
        base_url: Option<String>,
        api_key: String,
        model: String,
        max_tokens: Option<u32>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model,
            max_tokens,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

// --- Wire types ---

#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct WireMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: WireFunctionCall,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct WireFunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize, Clone)]
struct WireToolDef {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunctionDef,
}

#[derive(Serialize, Clone)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
pub(crate) struct ChatCompletionResponse {
    pub choices: Option<Vec<ChatChoice>>,
    pub model: Option<String>,
    pub usage: Option<WireUsage>,
}

#[derive(Deserialize)]
pub(crate) struct ChatChoice {
    pub message: Option<WireMessage>,
}

#[derive(Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// Serialise the transcript to the chat-completions wire shape.
///
/// Assistant turns keep their `tool_calls`: every `tool`-role message must
/// follow an assistant message carrying the matching call id, or the
/// endpoint rejects the request.
pub(crate) fn to_wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|m| {
            let tool_calls = if m.tool_calls.is_empty() {
                None
            } else {
                Some(
                    m.tool_calls
                        .iter()
                        .map(|call| WireToolCall {
                            id: call.id.clone(),
                            call_type: "function".to_string(),
                            function: WireFunctionCall {
                                name: call.name.clone(),
                                arguments: serde_json::to_string(&call.arguments)
                                    .unwrap_or_else(|_| "{}".to_string()),
                            },
                        })
                        .collect(),
                )
            };
            // Tool-call turns with no free text send `content: null`, the
            // way the API itself returns them.
            let content = if m.content.is_empty() && tool_calls.is_some() {
                None
            } else {
                Some(m.content.clone())
            };
            WireMessage {
                role: m.role.as_str().to_string(),
                content,
                tool_calls,
                tool_call_id: m.tool_call_id.clone(),
            }
        })
        .collect()
}

fn to_wire_tools(tools: &[ToolDefinition]) -> Option<Vec<WireToolDef>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|t| WireToolDef {
                tool_type: "function".to_string(),
                function: WireFunctionDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect(),
    )
}

/// Decode the wire `tool_calls` field into uniform [`ToolCall`]s.
///
/// Unparseable argument strings degrade to an empty map rather than failing
/// the whole reply.
pub(crate) fn decode_tool_calls(wire: &[WireToolCall]) -> Vec<ToolCall> {
    wire.iter()
        .map(|tc| {
            let arguments: HashMap<String, serde_json::Value> =
                serde_json::from_str(&tc.function.arguments).unwrap_or_else(|e| {
                    warn!(
                        "direct-api: unparseable arguments for {}: {e}",
                        tc.function.name
                    );
                    HashMap::new()
                });
            ToolCall {
                id: tc.id.clone(),
                name: tc.function.name.clone(),
                arguments,
            }
        })
        .collect()
}

/// Parse a chat-completions response body into the uniform reply.
pub(crate) fn parse_reply(
    parsed: ChatCompletionResponse,
    backend: &str,
) -> Result<LlmReply, HostError> {
    let choice = parsed
        .choices
        .and_then(|mut c| if c.is_empty() { None } else { Some(c.remove(0)) })
        .and_then(|c| c.message)
        .ok_or_else(|| HostError::Llm(format!("{backend}: response had no choices")))?;

    let tool_calls = choice
        .tool_calls
        .as_deref()
        .map(decode_tool_calls)
        .unwrap_or_default();

    Ok(LlmReply {
        content: choice.content.unwrap_or_default(),
        model: parsed.model,
        usage: parsed.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
        tool_calls,
    })
}

#[async_trait]
impl LlmBackend for DirectApiBackend {
    fn name(&self) -> &str {
        "direct-api"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmReply, HostError> {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: to_wire_messages(messages),
            tools: to_wire_tools(tools),
            max_tokens: self.max_tokens,
        };

        let url = self.chat_url();
        debug!("direct-api: POST {url} model={}", self.model);

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| HostError::Llm(format!("direct-api request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(HostError::Llm(format!(
                "direct-api returned {status}: {text}"
            )));
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| HostError::Llm(format!("direct-api: failed to parse response: {e}")))?;

        parse_reply(parsed, "direct-api")
    }

    async fn is_available(&self) -> bool {
        if self.api_key.is_empty() {
            warn!("direct-api: no API key configured");
            return false;
        }
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        match self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("direct-api not available: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages_carry_tool_binding() {
        let messages = vec![
            ChatMessage::system("Be terse."),
            ChatMessage::user("add 2 and 3"),
            ChatMessage::tool("5", "call_1"),
        ];
        let wire = to_wire_messages(&messages);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[2].role, "tool");
        assert_eq!(wire[2].tool_call_id.as_deref(), Some("call_1"));
    }

    fn add_call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "calc__add".into(),
            arguments: [
                ("a".to_string(), serde_json::json!(2)),
                ("b".to_string(), serde_json::json!(3)),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn test_assistant_tool_calls_survive_to_wire() {
        // A tool result must be preceded on the wire by an assistant message
        // carrying the matching tool_calls entry.
        let messages = vec![
            ChatMessage::user("add 2 and 3"),
            ChatMessage::assistant_with_tools("", vec![add_call("t1")]),
            ChatMessage::tool("5", "t1"),
        ];
        let wire = to_wire_messages(&messages);

        let assistant = &wire[1];
        assert_eq!(assistant.role, "assistant");
        assert!(assistant.content.is_none(), "empty tool-call turn sends null content");
        let calls = assistant.tool_calls.as_ref().expect("tool_calls present");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].call_type, "function");
        assert_eq!(calls[0].function.name, "calc__add");
        let args: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["a"], 2);
        assert_eq!(args["b"], 3);

        assert_eq!(wire[2].tool_call_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_request_body_pairs_tool_result_with_call() {
        let body = ChatCompletionRequest {
            model: "gpt-4o".into(),
            messages: to_wire_messages(&[
                ChatMessage::user("add 2 and 3"),
                ChatMessage::assistant_with_tools("", vec![add_call("t1")]),
                ChatMessage::tool("5", "t1"),
            ]),
            tools: None,
            max_tokens: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages[1]["tool_calls"][0]["id"], "t1");
        assert_eq!(messages[1]["tool_calls"][0]["type"], "function");
        assert_eq!(
            messages[1]["tool_calls"][0]["function"]["name"],
            "calc__add"
        );
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "t1");
        // The assistant turn that made the call keeps no phantom content
        // (the None is skipped on the wire, which the API accepts).
        assert!(messages[1].get("content").is_none());
    }

    #[test]
    fn test_assistant_text_with_calls_keeps_content() {
        let wire = to_wire_messages(&[ChatMessage::assistant_with_tools(
            "Let me check.",
            vec![add_call("t2")],
        )]);
        assert_eq!(wire[0].content.as_deref(), Some("Let me check."));
        assert!(wire[0].tool_calls.is_some());
    }

    #[test]
    fn test_request_omits_empty_tools() {
        let body = ChatCompletionRequest {
            model: "gpt-4o".into(),
            messages: to_wire_messages(&[ChatMessage::user("hi")]),
            tools: to_wire_tools(&[]),
            max_tokens: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_tool_call_response_parsing() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":null,"tool_calls":[{"id":"call_1","type":"function","function":{"name":"calc__add","arguments":"{\"a\":2,\"b\":3}"}}]}}],"model":"gpt-4o","usage":{"prompt_tokens":10,"completion_tokens":5}}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        let reply = parse_reply(parsed, "direct-api").unwrap();
        assert_eq!(reply.content, "");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "calc__add");
        assert_eq!(reply.tool_calls[0].id, "call_1");
        assert_eq!(
            reply.tool_calls[0].arguments.get("a"),
            Some(&serde_json::json!(2))
        );
        assert_eq!(reply.usage.unwrap().input_tokens, 10);
    }

    #[test]
    fn test_text_response_parsing() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":"Hello!"}}],"model":"gpt-4o"}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        let reply = parse_reply(parsed, "direct-api").unwrap();
        assert_eq!(reply.content, "Hello!");
        assert!(reply.tool_calls.is_empty());
    }

    #[test]
    fn test_empty_choices_is_error() {
        let json = r#"{"choices":[]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        assert!(parse_reply(parsed, "direct-api").is_err());
    }

    #[test]
    fn test_bad_arguments_degrade_to_empty_map() {
        let wire = vec![WireToolCall {
            id: "t1".into(),
            call_type: "function".into(),
            function: WireFunctionCall {
                name: "calc__add".into(),
                arguments: "not json".into(),
            },
        }];
        let calls = decode_tool_calls(&wire);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].arguments.is_empty());
    }

    #[test]
    fn test_role_round_trip_through_wire() {
        assert_eq!(Role::Assistant.as_str(), "assistant");
        let wire = to_wire_messages(&[ChatMessage::assistant("ok")]);
        assert_eq!(wire[0].role, "assistant");
    }
}
