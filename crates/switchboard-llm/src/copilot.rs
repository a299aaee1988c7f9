//! GitHub Copilot chat backend.
//!
//! Exchanges a GitHub token for a short-lived Copilot session token, then
//! speaks the OpenAI-compatible chat wire format against the Copilot
//! endpoint. The session token is cached and refreshed shortly before expiry.

use crate::direct_api::{parse_reply, to_wire_messages, ChatCompletionResponse};
use crate::LlmBackend;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use switchboard_core::chat::{ChatMessage, LlmReply, ToolDefinition};
use switchboard_core::error::HostError;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const CHAT_URL: &str = "https://api.githubcopilot.com/chat/completions";
/// Refresh this long before the reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(120);

/// Credential-mediated Copilot backend.
pub struct CopilotBackend {
    client: reqwest::Client,
    github_token: String,
    model: String,
    session: Mutex<Option<SessionToken>>,
}

struct SessionToken {
    token: String,
    refresh_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    /// Epoch seconds.
    expires_at: Option<i64>,
}

impl CopilotBackend {
    pub fn new(github_token: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            github_token,
            model,
            session: Mutex::new(None),
        }
    }

    /// Return a valid session token, exchanging the GitHub token when the
    /// cached one is missing or near expiry.
    async fn session_token(&self) -> Result<String, HostError> {
        let mut cached = self.session.lock().await;
        if let Some(ref session) = *cached {
            if Instant::now() < session.refresh_at {
                return Ok(session.token.clone());
            }
        }

        debug!("copilot: exchanging github token for session token");
        let resp = self
            .client
            .get(TOKEN_URL)
            .header("Authorization", format!("token {}", self.github_token))
            .header("User-Agent", "switchboard")
            .send()
            .await
            .map_err(|e| HostError::Llm(format!("copilot token exchange failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(HostError::Llm(format!(
                "copilot token exchange returned {status}"
            )));
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| HostError::Llm(format!("copilot: bad token response: {e}")))?;

        let ttl = parsed
            .expires_at
            .map(|at| {
                let now = chrono::Utc::now().timestamp();
                Duration::from_secs(at.saturating_sub(now).max(0) as u64)
            })
            .unwrap_or(Duration::from_secs(600));
        let refresh_at = Instant::now() + ttl.saturating_sub(EXPIRY_MARGIN);

        let token = parsed.token.clone();
        *cached = Some(SessionToken {
            token: parsed.token,
            refresh_at,
        });
        Ok(token)
    }
}

#[async_trait]
impl LlmBackend for CopilotBackend {
    fn name(&self) -> &str {
        "copilot"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmReply, HostError> {
        let session = self.session_token().await?;

        // Copilot does not accept a tool catalogue on every model; when tools
        // are present they are serialised the OpenAI way.
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": to_wire_messages(messages),
        });
        if !tools.is_empty() {
            let wire_tools: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(wire_tools);
        }

        debug!("copilot: POST {CHAT_URL} model={}", self.model);

        let resp = self
            .client
            .post(CHAT_URL)
            .header("Authorization", format!("Bearer {session}"))
            .header("Editor-Version", "switchboard/0.4")
            .json(&body)
            .send()
            .await
            .map_err(|e| HostError::Llm(format!("copilot request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(HostError::Llm(format!("copilot returned {status}: {text}")));
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| HostError::Llm(format!("copilot: failed to parse response: {e}")))?;

        parse_reply(parsed, "copilot")
    }

    async fn is_available(&self) -> bool {
        if self.github_token.is_empty() {
            warn!("copilot: no github token configured");
            return false;
        }
        self.session_token().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copilot_name() {
        let b = CopilotBackend::new("ghu_test".into(), "gpt-4o".into());
        assert_eq!(b.name(), "copilot");
    }

    #[test]
    fn test_token_response_parsing() {
        let json = r#"{"token":"tid=abc;exp=123","expires_at":1900000000}"#;
        let parsed: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.token, "tid=abc;exp=123");
        assert_eq!(parsed.expires_at, Some(1_900_000_000));
    }

    #[tokio::test]
    async fn test_unavailable_without_token() {
        let b = CopilotBackend::new(String::new(), "gpt-4o".into());
        assert!(!b.is_available().await);
    }
}
