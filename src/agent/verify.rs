//! Response verification: rule checks, LLM review, and the retry loop
//! predicate.
//!
//! Verifiers are contracts, not guarantees: any internal failure in the LLM
//! reviewer yields a neutral pass so verification never blocks delivery.

use regex::Regex;
use std::sync::OnceLock;
use switchboard_core::config::VerificationConfig;
use switchboard_llm::LlmService;
use tracing::warn;

/// Verifier rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rating {
    Good,
    NeedsFix,
    Redo,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "GOOD",
            Self::NeedsFix => "NEEDS_FIX",
            Self::Redo => "REDO",
        }
    }
}

/// One verifier's judgement.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub passed: bool,
    pub rating: Rating,
    pub feedback: String,
    pub confidence: f64,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            rating: Rating::Good,
            feedback: String::new(),
            confidence: 1.0,
        }
    }

    fn fail(rating: Rating, feedback: &str) -> Self {
        Self {
            passed: false,
            rating,
            feedback: feedback.to_string(),
            confidence: 1.0,
        }
    }
}

fn greeting_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(hi|hello|hey|thanks|thank you|ok|bye)[!.]?$").expect("greeting regex")
    })
}

/// Whether a response should go through the verification loop at all.
pub fn should_verify(request: &str, response: &str, config: &VerificationConfig) -> bool {
    if !config.enabled {
        return false;
    }
    if config.skip_for_short_responses
        && response.chars().count() < config.short_response_threshold
    {
        return false;
    }
    if greeting_re().is_match(request.trim()) {
        return false;
    }
    true
}

const APOLOGY_PREFIXES: &[&str] = &[
    "i'm sorry",
    "i am sorry",
    "i apologize",
    "i apologise",
    "sorry,",
    "i can't",
    "i cannot",
    "unfortunately, i can",
];

const CODE_KEYWORDS: &[&str] = &[
    "write", "create", "implement", "code", "function", "class", "script", "program",
];

const TERMINATORS: &[char] = &['.', '!', '?', '\n', '`', '"', ')', ']'];

/// Completeness: empty, apology-prefixed, or truncated responses fail.
fn completeness(response: &str) -> Option<Verdict> {
    let stripped = response.trim();
    if stripped.is_empty() {
        return Some(Verdict::fail(Rating::Redo, "Response is empty"));
    }
    let lower = stripped.to_lowercase();
    if APOLOGY_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return Some(Verdict::fail(
            Rating::NeedsFix,
            "Response opens with an apology or refusal",
        ));
    }
    if response.chars().count() > 100 {
        let last = response.chars().rev().find(|c| *c != ' ');
        if let Some(last) = last {
            if !TERMINATORS.contains(&last) {
                return Some(Verdict::fail(
                    Rating::NeedsFix,
                    "Response appears truncated",
                ));
            }
        }
    }
    None
}

/// Code-quality: a code request should produce a fenced block.
fn code_quality(request: &str, response: &str) -> Option<Verdict> {
    let lower = request.to_lowercase();
    let wants_code = CODE_KEYWORDS.iter().any(|kw| lower.contains(kw));
    if wants_code && !response.contains("```") {
        return Some(Verdict::fail(
            Rating::NeedsFix,
            "Code was requested but the response has no code block",
        ));
    }
    None
}

/// Direct-answer: a question deserves more than a fragment.
fn direct_answer(request: &str, response: &str) -> Option<Verdict> {
    if request.trim_end().ends_with('?') && response.trim().chars().count() < 10 {
        return Some(Verdict::fail(
            Rating::NeedsFix,
            "The question was not answered substantively",
        ));
    }
    None
}

/// Rule verifier: sub-checks in order, first failure wins.
pub fn rule_verdict(request: &str, response: &str) -> Verdict {
    if let Some(verdict) = completeness(response) {
        return verdict;
    }
    if let Some(verdict) = code_quality(request, response) {
        return verdict;
    }
    if let Some(verdict) = direct_answer(request, response) {
        return verdict;
    }
    Verdict::pass()
}

const REVIEW_SYSTEM_PROMPT: &str = "You are a strict response reviewer. Given a user request and a \
candidate response, judge whether the response fully and correctly addresses the request. Respond \
with ONLY a JSON object: {\"rating\": \"GOOD|NEEDS_FIX|REDO\", \"feedback\": \"...\", \
\"confidence\": 0..1}. Use NEEDS_FIX for fixable issues, REDO when the response must be rewritten \
from scratch.";

#[derive(serde::Deserialize)]
struct ReviewJson {
    rating: String,
    #[serde(default)]
    feedback: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

/// Find the first balanced JSON object in free text.
fn first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{')?;
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
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// LLM reviewer. Any parsing or transport failure returns a neutral pass so
/// verification never blocks delivery.
pub async fn llm_verdict(
    llm: &LlmService,
    request: &str,
    response: &str,
    threshold: f64,
) -> Verdict {
    let user = format!("Request:\n{request}\n\nCandidate response:\n{response}");
    let raw = match llm.complete(REVIEW_SYSTEM_PROMPT, &user).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!("llm review unavailable, passing response through: {e}");
            return neutral_pass();
        }
    };
    let Some(object) = first_json_object(&raw) else {
        warn!("llm review returned no JSON, passing response through");
        return neutral_pass();
    };
    let Ok(parsed) = serde_json::from_str::<ReviewJson>(object) else {
        warn!("llm review returned malformed JSON, passing response through");
        return neutral_pass();
    };

    let confidence = parsed.confidence.clamp(0.0, 1.0);
    let rating = match parsed.rating.as_str() {
        "GOOD" => Rating::Good,
        "REDO" => Rating::Redo,
        _ => Rating::NeedsFix,
    };
    let passed = rating == Rating::Good && confidence >= threshold;
    Verdict {
        passed,
        rating,
        feedback: parsed.feedback,
        confidence,
    }
}

fn neutral_pass() -> Verdict {
    Verdict {
        passed: true,
        rating: Rating::Good,
        feedback: String::new(),
        confidence: 0.5,
    }
}
