//! Front-matter and slash-command parsing.

use serde::Deserialize;

/// Parsed `SKILL.md` front matter.
#[derive(Debug, Deserialize)]
pub(crate) struct FrontMatter {
    pub name: String,
    pub description: String,
    #[serde(default = "default_true", rename = "user-invocable")]
    pub user_invocable: bool,
    #[serde(default, rename = "argument-hint")]
    pub argument_hint: Option<String>,
    #[serde(default, rename = "disable-model-invocation")]
    pub disable_model_invocation: bool,
    #[serde(default, rename = "allowed-tools")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub context: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Extract front matter delimited by `---` lines, returning it with the
/// remaining Markdown body.
///
/// Tries TOML first (`key = "value"`), then falls back to flat YAML-style
/// `key: value` lines so skill files from any source just work.
pub(crate) fn parse_front_matter(content: &str) -> Option<(FrontMatter, String)> {
    let trimmed = content.trim_start();
    let rest = trimmed.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let block = &rest[..end];
    let body = rest[end + 4..].trim().to_string();

    if let Ok(front) = toml::from_str::<FrontMatter>(block) {
        return Some((front, body));
    }
    parse_yaml_block(block).map(|front| (front, body))
}

/// Lightweight YAML-style front-matter parser: flat `key: value` lines,
/// booleans, and inline lists. No YAML dependency needed.
fn parse_yaml_block(block: &str) -> Option<FrontMatter> {
    let mut name = None;
    let mut description = None;
    let mut user_invocable = true;
    let mut argument_hint = None;
    let mut disable_model_invocation = false;
    let mut allowed_tools = None;
    let mut context = None;

    for line in block.lines() {
        let line = line.trim();
        let Some((key, val)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();
        match key {
            "name" => name = Some(unquote(val)),
            "description" => description = Some(unquote(val)),
            "user-invocable" => user_invocable = val != "false",
            "argument-hint" => argument_hint = Some(unquote(val)),
            "disable-model-invocation" => disable_model_invocation = val == "true",
            "allowed-tools" => allowed_tools = Some(parse_inline_list(val)),
            "context" => context = Some(unquote(val)),
            _ => {}
        }
    }

    Some(FrontMatter {
        name: name?,
        description: description?,
        user_invocable,
        argument_hint,
        disable_model_invocation,
        allowed_tools,
        context,
    })
}

/// Parse an inline list: `[a, b]` or `["a", "b"]`.
fn parse_inline_list(val: &str) -> Vec<String> {
    let inner = val
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or("");
    if inner.is_empty() {
        return Vec::new();
    }
    inner
        .split(',')
        .map(|s| unquote(s.trim()))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Strip surrounding quotes (single or double).
fn unquote(s: &str) -> String {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')) {
        if s.len() >= 2 {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// Parse `^/<name>(\s+<args>)?`: a slash command with optional argument text.
///
/// Returns `None` for anything that is not a slash command. Unknown names
/// are the caller's concern (they pass through to the normal pipeline).
pub fn parse_slash_command(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix('/')?;
    let name: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if name.is_empty() {
        return None;
    }
    let after = &rest[name.len()..];
    if !after.is_empty() && !after.starts_with(char::is_whitespace) {
        return None;
    }
    Some((name, after.trim().to_string()))
}

/// Substitute `$ARGUMENTS` into skill instructions; empty argument text
/// substitutes the literal `(no arguments)`.
pub fn substitute_arguments(instructions: &str, args: &str) -> String {
    let value = if args.trim().is_empty() {
        "(no arguments)"
    } else {
        args
    };
    instructions.replace("$ARGUMENTS", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_front_matter() {
        let content = "---\nname = \"gist\"\ndescription = \"Summarize.\"\ndisable-model-invocation = true\n---\n\nBody text.\n";
        let (front, body) = parse_front_matter(content).unwrap();
        assert_eq!(front.name, "gist");
        assert!(front.user_invocable, "defaults to true");
        assert!(front.disable_model_invocation);
        assert_eq!(body, "Body text.");
    }

    #[test]
    fn test_parse_yaml_front_matter() {
        let content = "---\nname: gist\ndescription: Summarize text.\nuser-invocable: false\nallowed-tools: [calc__add, web__search]\n---\nBody.";
        let (front, body) = parse_front_matter(content).unwrap();
        assert_eq!(front.name, "gist");
        assert!(!front.user_invocable);
        assert_eq!(
            front.allowed_tools.unwrap(),
            vec!["calc__add", "web__search"]
        );
        assert_eq!(body, "Body.");
    }

    #[test]
    fn test_parse_no_front_matter() {
        assert!(parse_front_matter("Just text.").is_none());
        assert!(parse_front_matter("---\nunterminated").is_none());
    }

    #[test]
    fn test_slash_command_parsing() {
        assert_eq!(
            parse_slash_command("/clear"),
            Some(("clear".into(), String::new()))
        );
        assert_eq!(
            parse_slash_command("/translate fr bonjour"),
            Some(("translate".into(), "fr bonjour".into()))
        );
        assert_eq!(parse_slash_command("not a command"), None);
        assert_eq!(parse_slash_command("/"), None);
        assert_eq!(parse_slash_command("3/4 done"), None);
    }

    #[test]
    fn test_slash_command_rejects_glued_punctuation() {
        // "/what?" is conversational, not a command.
        assert_eq!(parse_slash_command("/what?"), None);
    }

    #[test]
    fn test_substitute_arguments() {
        assert_eq!(
            substitute_arguments("Translate to $ARGUMENTS.", "french"),
            "Translate to french."
        );
        assert_eq!(
            substitute_arguments("Args: $ARGUMENTS", ""),
            "Args: (no arguments)"
        );
        assert_eq!(
            substitute_arguments("Args: $ARGUMENTS", "   "),
            "Args: (no arguments)"
        );
    }
}
