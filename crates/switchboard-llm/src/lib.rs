//! # switchboard-llm
//!
//! A uniform chat/complete interface over heterogeneous LLM backends.
//!
//! Backends expose either a chat-style interface (messages + tools → text +
//! optional tool calls) or only a single-string completion. Chat-capable
//! backends implement [`LlmBackend`] directly; completion-only backends
//! implement [`CompletionBackend`] and are wrapped by
//! [`adapter::CompletionAdapter`], which flattens the transcript into one
//! prompt and scans the response for an embedded JSON tool call.

pub mod adapter;
pub mod claude_code;
pub mod copilot;
pub mod direct_api;

use adapter::CompletionAdapter;
use async_trait::async_trait;
use claude_code::ClaudeCodeBackend;
use copilot::CopilotBackend;
use direct_api::DirectApiBackend;
use std::sync::Arc;
use switchboard_core::chat::{ChatMessage, LlmReply, ToolDefinition};
use switchboard_core::config::{LlmConfig, LlmProviderKind, LlmReviewConfig};
use switchboard_core::error::HostError;

/// A chat-style LLM backend.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend name for logs and status.
    fn name(&self) -> &str;

    /// One model call over the transcript with an optional tool catalogue.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmReply, HostError>;

    /// Whether the backend is reachable and ready.
    async fn is_available(&self) -> bool;
}

/// A backend that only supports single-string completion.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Complete a flattened prompt. Returns the text and, when the backend
    /// reports it, the model that produced it.
    async fn complete(&self, prompt: &str) -> Result<(String, Option<String>), HostError>;

    async fn is_available(&self) -> bool;
}

/// The service wrapper handed to the pipeline: uniform `chat` and `complete`
/// over whatever backend configuration selected.
#[derive(Clone)]
pub struct LlmService {
    backend: Arc<dyn LlmBackend>,
}

impl LlmService {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self { backend }
    }

    /// Build the configured backend.
    pub fn from_config(config: &LlmConfig) -> Result<Self, HostError> {
        Self::for_provider(config.provider, &config.model, config)
    }

    /// Build the verifier backend: a possibly distinct provider/model, falling
    /// back to the primary configuration.
    pub fn for_review(config: &LlmConfig, review: &LlmReviewConfig) -> Result<Self, HostError> {
        let provider = review.provider.unwrap_or(config.provider);
        let model = review.model.as_deref().unwrap_or(&config.model);
        Self::for_provider(provider, model, config)
    }

    fn for_provider(
        provider: LlmProviderKind,
        model: &str,
        config: &LlmConfig,
    ) -> Result<Self, HostError> {
        let backend: Arc<dyn LlmBackend> = match provider {
            LlmProviderKind::DirectApi => {
                let api_key = config.api_key.clone().ok_or_else(|| {
                    HostError::Config("llm.apiKey is required for the direct-api provider".into())
                })?;
                Arc::new(DirectApiBackend::new(
                    config.base_url.clone(),
                    api_key,
                    model.to_string(),
                    config.max_tokens,
                ))
            }
            LlmProviderKind::Copilot => {
                let token = config.github_token.clone().ok_or_else(|| {
                    HostError::Config("llm.githubToken is required for the copilot provider".into())
                })?;
                Arc::new(CopilotBackend::new(token, model.to_string()))
            }
            LlmProviderKind::ClaudeCode => Arc::new(CompletionAdapter::new(
                ClaudeCodeBackend::new(model.to_string()),
            )),
        };
        Ok(Self { backend })
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmReply, HostError> {
        self.backend.chat(messages, tools).await
    }

    /// Single system + user completion, no tools. The reply's free text.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String, HostError> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let reply = self.backend.chat(&messages, &[]).await?;
        Ok(reply.content)
    }

    pub async fn is_available(&self) -> bool {
        self.backend.is_available().await
    }
}
