//! # switchboard-skills
//!
//! Skill registry for the agent host. A skill is a named unit of behaviour:
//! either built-in (programmatic, wired at startup with a late-bound
//! executor) or content-based (instructions loaded from a `SKILL.md` body,
//! run through an LLM completion). Skills are invokable by slash command and,
//! unless opted out, offered to the model as `skill__<name>` tools.

mod parse;

pub use parse::{parse_slash_command, substitute_arguments};

use futures::future::BoxFuture;
use parse::parse_front_matter;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use switchboard_core::chat::ToolDefinition;
use tracing::{info, warn};

/// Where a skill came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillSource {
    Builtin,
    SkillMd,
}

/// Context propagation mode for a content skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillContextMode {
    Fork,
    Inherit,
}

/// Input handed to a builtin skill's executor.
#[derive(Debug, Clone)]
pub struct SkillContext {
    pub channel_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    /// Argument text after the slash command, trimmed.
    pub args: String,
}

/// A builtin skill's result.
#[derive(Debug, Clone)]
pub struct SkillOutcome {
    pub text: String,
    pub handled: bool,
}

/// Programmatic executor installed after construction (late binding: the
/// builtins need the agent service's dependencies, which do not exist yet
/// when the registry is built).
pub type SkillExecutor =
    Arc<dyn Fn(SkillContext) -> BoxFuture<'static, SkillOutcome> + Send + Sync>;

/// A registered skill.
#[derive(Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub user_invocable: bool,
    pub argument_hint: Option<String>,
    pub disable_model_invocation: bool,
    pub allowed_tools: Option<Vec<String>>,
    pub context: Option<SkillContextMode>,
    /// Markdown body used verbatim as instructions (content skills).
    pub instructions: Option<String>,
    pub source: SkillSource,
    pub executor: Option<SkillExecutor>,
}

impl Skill {
    /// A builtin skeleton: programmatic, executor installed later.
    pub fn builtin(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            user_invocable: true,
            argument_hint: None,
            disable_model_invocation: true,
            allowed_tools: None,
            context: None,
            instructions: None,
            source: SkillSource::Builtin,
            executor: None,
        }
    }

    /// Whether this skill is offered to the model as a `skill__<name>` tool.
    pub fn model_invocable(&self) -> bool {
        !self.disable_model_invocation && self.instructions.is_some()
    }
}

/// The builtin command set. Executors are installed by the agent service.
pub fn builtin_skills() -> Vec<Skill> {
    vec![
        Skill::builtin("help", "List available commands"),
        Skill::builtin("status", "Show host status"),
        Skill::builtin("skills", "List loaded skills"),
        Skill::builtin("history", "Show recent conversation history"),
        Skill::builtin("clear", "Clear conversation history"),
        Skill::builtin("retry", "Resend the last response"),
    ]
}

/// Skill registry keyed by name.
pub struct SkillRegistry {
    skills: RwLock<HashMap<String, Skill>>,
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self {
            skills: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, skill: Skill) {
        let mut skills = self.skills.write().unwrap_or_else(|e| e.into_inner());
        skills.insert(skill.name.clone(), skill);
    }

    /// Install a programmatic executor on an already-registered skill.
    pub fn install_executor(&self, name: &str, executor: SkillExecutor) {
        let mut skills = self.skills.write().unwrap_or_else(|e| e.into_inner());
        match skills.get_mut(name) {
            Some(skill) => skill.executor = Some(executor),
            None => warn!("skills: cannot install executor, {name} is not registered"),
        }
    }

    pub fn get(&self, name: &str) -> Option<Skill> {
        let skills = self.skills.read().unwrap_or_else(|e| e.into_inner());
        skills.get(name).cloned()
    }

    /// Every skill, sorted by name.
    pub fn list(&self) -> Vec<Skill> {
        let skills = self.skills.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Skill> = skills.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// One `skill__<name>` tool per model-invocable content skill, each with
    /// a single `arguments` string input.
    pub fn skill_tools(&self) -> Vec<ToolDefinition> {
        self.list()
            .into_iter()
            .filter(|s| s.model_invocable())
            .map(|s| ToolDefinition {
                name: format!("skill__{}", s.name),
                description: s.description.clone(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "arguments": {
                            "type": "string",
                            "description": "Argument text for the skill",
                        }
                    },
                }),
            })
            .collect()
    }

    /// Scan one or more skill directories, each subdirectory holding a
    /// `SKILL.md`. Invalid files are skipped with a warning.
    pub fn load_directories(&self, directories: &[String]) {
        for dir in directories {
            let expanded = expand_tilde(dir);
            let entries = match std::fs::read_dir(&expanded) {
                Ok(e) => e,
                Err(_) => {
                    info!("skills: directory {expanded} not found, skipping");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let skill_file = path.join("SKILL.md");
                match load_skill_file(&skill_file) {
                    Some(skill) => {
                        info!("skills: loaded {} from {}", skill.name, skill_file.display());
                        self.register(skill);
                    }
                    None => {
                        if skill_file.exists() {
                            warn!("skills: no valid front matter in {}", skill_file.display());
                        }
                    }
                }
            }
        }
    }
}

/// Parse one `SKILL.md` into a content skill.
fn load_skill_file(path: &Path) -> Option<Skill> {
    let content = std::fs::read_to_string(path).ok()?;
    let (front, body) = parse_front_matter(&content)?;
    Some(Skill {
        name: front.name,
        description: front.description,
        user_invocable: front.user_invocable,
        argument_hint: front.argument_hint,
        disable_model_invocation: front.disable_model_invocation,
        allowed_tools: front.allowed_tools,
        context: match front.context.as_deref() {
            Some("fork") => Some(SkillContextMode::Fork),
            Some("inherit") => Some(SkillContextMode::Inherit),
            _ => None,
        },
        instructions: Some(body),
        source: SkillSource::SkillMd,
        executor: None,
    })
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}
