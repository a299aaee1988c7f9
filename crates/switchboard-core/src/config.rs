//! Typed configuration schema and YAML loading.
//!
//! The file is YAML with `${NAME}` environment-variable substitution applied
//! to the raw text before parsing. Any missing variable substitutes to the
//! empty string with a warning.

use crate::error::HostError;
use crate::traits::ChannelKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

/// Top-level host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub persona: PersonaConfig,
    pub llm: LlmConfig,
    pub channels: HashMap<String, ChannelConfig>,
    pub mcp: McpConfig,
    pub verification: VerificationConfig,
    pub skills: SkillsConfig,
    pub history: HistoryConfig,
    pub health: HealthConfig,
    pub journal: JournalConfig,
    pub task_persistence: TaskPersistenceConfig,
    pub web: WebConfig,
}

/// Agent persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersonaConfig {
    pub name: String,
    pub system_prompt: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: "assistant".to_string(),
            system_prompt: "You are a helpful assistant.".to_string(),
        }
    }
}

/// Which LLM transport backs the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LlmProviderKind {
    #[serde(rename = "direct-api")]
    DirectApi,
    #[serde(rename = "copilot")]
    Copilot,
    #[serde(rename = "claude-code")]
    ClaudeCode,
}

/// LLM backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmConfig {
    pub provider: LlmProviderKind,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub github_token: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::DirectApi,
            model: String::new(),
            api_key: None,
            base_url: None,
            max_tokens: None,
            github_token: None,
        }
    }
}

/// Per-channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    pub enabled: bool,
    pub token: Option<String>,
    pub session_data_path: Option<String>,
    pub puppet_provider: Option<String>,
    pub enabled_skills: Option<Vec<String>>,
    pub verification: Option<VerificationConfig>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::Web,
            enabled: false,
            token: None,
            session_data_path: None,
            puppet_provider: None,
            enabled_skills: None,
            verification: None,
        }
    }
}

/// MCP server processes to launch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub servers: HashMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct McpServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// Response verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub confidence_threshold: f64,
    pub skip_for_short_responses: bool,
    pub short_response_threshold: usize,
    pub llm_review: LlmReviewConfig,
    pub rules: RulesConfig,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            confidence_threshold: 0.7,
            skip_for_short_responses: true,
            short_response_threshold: 50,
            llm_review: LlmReviewConfig::default(),
            rules: RulesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmReviewConfig {
    pub enabled: bool,
    pub provider: Option<LlmProviderKind>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RulesConfig {
    pub enabled: bool,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// External skill directories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillsConfig {
    pub directories: Vec<String>,
}

/// History store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryConfig {
    pub data_dir: Option<String>,
    pub max_messages: usize,
    pub max_segment_size_bytes: u64,
    pub max_segments: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_messages: 100,
            max_segment_size_bytes: 524_288,
            max_segments: 20,
        }
    }
}

/// Health subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    pub check_interval_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Recovery notice targets, each `channelId:conversationId`.
    pub recovery_notify_targets: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3001,
            heartbeat_interval_secs: 10,
            check_interval_ms: 30_000,
            reconnect_base_delay_ms: 2_000,
            reconnect_max_delay_ms: 120_000,
            max_reconnect_attempts: 10,
            recovery_notify_targets: Vec::new(),
        }
    }
}

/// Journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JournalConfig {
    pub enabled: bool,
    pub max_segment_size_bytes: u64,
    pub max_segments: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_segment_size_bytes: 1_048_576,
            max_segments: 10,
        }
    }
}

/// Task persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskPersistenceConfig {
    pub enabled: bool,
    pub recover_on_startup: bool,
}

impl Default for TaskPersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recover_on_startup: true,
        }
    }
}

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3000,
        }
    }
}

/// Resolve the data root: `$MESSAGE_AGENT_DATA_DIR` or `~/.message-agent-host`.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("MESSAGE_AGENT_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    PathBuf::from(home).join(".message-agent-host")
}

/// Load a config file, applying `${NAME}` substitution before parsing.
pub fn load(path: &str) -> Result<Config, HostError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| HostError::Config(format!("cannot read {path}: {e}")))?;
    parse(&raw)
}

/// Parse config text (exposed separately for tests).
pub fn parse(raw: &str) -> Result<Config, HostError> {
    let substituted = substitute_env(raw);
    serde_yaml::from_str(&substituted).map_err(|e| HostError::Config(format!("invalid config: {e}")))
}

/// Replace each `${NAME}` with the environment variable's value.
///
/// Unset variables substitute to the empty string. A `$` not followed by `{`
/// passes through untouched.
pub fn substitute_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => {
                        warn!("config: ${{{name}}} is not set, substituting empty string");
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated; emit verbatim and stop scanning.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: Config = parse("{}").unwrap();
        assert_eq!(cfg.verification.max_retries, 3);
        assert!((cfg.verification.confidence_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.verification.short_response_threshold, 50);
        assert_eq!(cfg.history.max_segment_size_bytes, 524_288);
        assert_eq!(cfg.history.max_segments, 20);
        assert_eq!(cfg.history.max_messages, 100);
        assert_eq!(cfg.journal.max_segment_size_bytes, 1_048_576);
        assert_eq!(cfg.journal.max_segments, 10);
        assert!(cfg.task_persistence.recover_on_startup);
        assert!(cfg.web.enabled);
        assert_eq!(cfg.web.port, 3000);
        assert_eq!(cfg.health.port, 3001);
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
persona:
  name: iris
  systemPrompt: "You are Iris."
llm:
  provider: claude-code
  model: claude-sonnet-4
channels:
  tg:
    type: telegram
    enabled: true
    token: "123:abc"
  web:
    type: web
    enabled: true
mcp:
  servers:
    calc:
      command: calc-mcp
      args: ["--stdio"]
verification:
  enabled: true
  maxRetries: 2
skills:
  directories: ["~/.skills"]
"#;
        let cfg = parse(yaml).unwrap();
        assert_eq!(cfg.persona.name, "iris");
        assert_eq!(cfg.llm.provider, LlmProviderKind::ClaudeCode);
        assert_eq!(cfg.channels["tg"].kind, ChannelKind::Telegram);
        assert_eq!(cfg.channels["tg"].token.as_deref(), Some("123:abc"));
        assert_eq!(cfg.mcp.servers["calc"].command, "calc-mcp");
        assert!(cfg.verification.enabled);
        assert_eq!(cfg.verification.max_retries, 2);
        assert_eq!(cfg.skills.directories, vec!["~/.skills"]);
    }

    #[test]
    fn test_substitute_env() {
        std::env::set_var("__SWB_TEST_TOKEN__", "secret");
        assert_eq!(
            substitute_env("token: ${__SWB_TEST_TOKEN__}"),
            "token: secret"
        );
        assert_eq!(substitute_env("no vars here"), "no vars here");
        assert_eq!(substitute_env("cost: $5"), "cost: $5");
        assert_eq!(
            substitute_env("a ${__SWB_TEST_TOKEN__} b ${__SWB_TEST_TOKEN__}"),
            "a secret b secret"
        );
        std::env::remove_var("__SWB_TEST_TOKEN__");
    }

    #[test]
    fn test_substitute_env_missing_is_empty() {
        assert_eq!(substitute_env("x${__SWB_NO_SUCH_VAR__}y"), "xy");
    }

    #[test]
    fn test_substitute_env_unterminated() {
        assert_eq!(substitute_env("broken ${NAME"), "broken ${NAME");
    }

    #[test]
    fn test_provider_kind_serde() {
        let k: LlmProviderKind = serde_yaml::from_str("direct-api").unwrap();
        assert_eq!(k, LlmProviderKind::DirectApi);
        let k: LlmProviderKind = serde_yaml::from_str("copilot").unwrap();
        assert_eq!(k, LlmProviderKind::Copilot);
    }

    #[test]
    fn test_invalid_config_is_error() {
        assert!(parse("llm: [not, a, map]").is_err());
    }

    #[test]
    fn test_data_dir_env_override() {
        std::env::set_var("MESSAGE_AGENT_DATA_DIR", "/tmp/__swb_data__");
        assert_eq!(data_dir(), PathBuf::from("/tmp/__swb_data__"));
        std::env::remove_var("MESSAGE_AGENT_DATA_DIR");
        let d = data_dir();
        assert!(d.ends_with(".message-agent-host"));
    }
}
