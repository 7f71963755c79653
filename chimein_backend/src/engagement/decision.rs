use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CompletionOracle, CompletionRequest};

pub const DECISION_MAX_TOKENS: u32 = 300;
pub const DECISION_TEMPERATURE: f32 = 0.3;

const DECISION_SYSTEM_PROMPT: &str = "You moderate a lively community chat. \
     You decide whether one of the community's characters should naturally chime in. \
     Most of the time the right answer is to stay quiet.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResponseTone {
    Helpful,
    Funny,
    Curious,
    Concerned,
    Excited,
    Supportive,
    Thoughtful,
    Playful,
    Other(String),
}

impl ResponseTone {
    pub fn as_str(&self) -> &str {
        match self {
            ResponseTone::Helpful => "helpful",
            ResponseTone::Funny => "funny",
            ResponseTone::Curious => "curious",
            ResponseTone::Concerned => "concerned",
            ResponseTone::Excited => "excited",
            ResponseTone::Supportive => "supportive",
            ResponseTone::Thoughtful => "thoughtful",
            ResponseTone::Playful => "playful",
            ResponseTone::Other(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "helpful" => ResponseTone::Helpful,
            "funny" => ResponseTone::Funny,
            "curious" => ResponseTone::Curious,
            "concerned" => ResponseTone::Concerned,
            "excited" => ResponseTone::Excited,
            "supportive" => ResponseTone::Supportive,
            "thoughtful" => ResponseTone::Thoughtful,
            "playful" => ResponseTone::Playful,
            _ => ResponseTone::Other(raw.trim().to_string()),
        }
    }
}

impl From<String> for ResponseTone {
    fn from(raw: String) -> Self {
        ResponseTone::parse(&raw)
    }
}

impl From<ResponseTone> for String {
    fn from(tone: ResponseTone) -> Self {
        tone.as_str().to_string()
    }
}

impl fmt::Display for ResponseTone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured answer of the reasoning oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementDecision {
    pub should_join: bool,
    pub persona: String,
    pub reason: String,
    pub response_tone: ResponseTone,
}

impl EngagementDecision {
    pub fn decline(reason: impl Into<String>) -> Self {
        Self {
            should_join: false,
            persona: String::new(),
            reason: reason.into(),
            response_tone: ResponseTone::Helpful,
        }
    }
}

pub struct DecisionMaker {
    oracle: Arc<dyn CompletionOracle>,
}

impl DecisionMaker {
    pub fn new(oracle: Arc<dyn CompletionOracle>) -> Self {
        Self { oracle }
    }

    /// Ask the reasoning oracle whether a persona should join. Fails closed:
    /// oracle errors and malformed answers both come back as a decline.
    pub async fn decide(&self, transcript: &str, persona_names: &[String]) -> EngagementDecision {
        let request = CompletionRequest {
            system: Some(DECISION_SYSTEM_PROMPT.to_string()),
            prompt: build_decision_prompt(transcript, persona_names),
            max_tokens: DECISION_MAX_TOKENS,
            temperature: DECISION_TEMPERATURE,
        };

        let raw = match self.oracle.complete(request).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Reasoning oracle call failed: {:#}", e);
                return EngagementDecision::decline("reasoning oracle unavailable");
            }
        };

        match parse_decision(&raw) {
            Some(decision) => {
                tracing::debug!(
                    "Decision: join={} persona='{}' tone={} reason='{}'",
                    decision.should_join,
                    decision.persona,
                    decision.response_tone,
                    decision.reason
                );
                decision
            }
            None => {
                tracing::warn!(
                    "Reasoning oracle answer had no usable decision object: {}",
                    raw.chars().take(300).collect::<String>()
                );
                EngagementDecision::decline("unparseable reasoning output")
            }
        }
    }
}

pub fn build_decision_prompt(transcript: &str, persona_names: &[String]) -> String {
    format!(
        "Characters who could join: {}\n\n\
         Recent conversation (oldest first):\n{}\n\n\
         Should one of these characters naturally join right now? \
         Only say yes when a character has something relevant, warm or fun to add \
         and joining would not interrupt a private or serious exchange.\n\n\
         IMPORTANT: Respond with ONLY one JSON object in this exact format:\n\
         {{\"should_join\": true or false, \"persona\": \"exact character name or empty\", \
         \"reason\": \"one short sentence\", \"response_tone\": \"helpful|funny|curious|concerned\"}}",
        persona_names.join(", "),
        transcript
    )
}

/// Parse the first balanced JSON object of `raw` into a decision.
///
/// Returns `None` on any deviation from the expected shape; later objects in
/// the text are never consulted.
pub fn parse_decision(raw: &str) -> Option<EngagementDecision> {
    let cleaned = strip_thinking_tags(raw);
    let candidate = first_balanced_object(&cleaned)?;
    let value: Value = serde_json::from_str(candidate).ok()?;
    let object = value.as_object()?;

    let should_join = object.get("should_join")?.as_bool()?;
    let persona = string_field(object, "persona")?;
    let reason = string_field(object, "reason")?;
    let tone = string_field(object, "response_tone")?;

    if should_join && persona.trim().is_empty() {
        return None;
    }

    Some(EngagementDecision {
        should_join,
        persona: persona.trim().to_string(),
        reason: reason.trim().to_string(),
        response_tone: ResponseTone::parse(&tone),
    })
}

/// Missing or null is empty; any non-string value is a shape violation.
fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key) {
        None | Some(Value::Null) => Some(String::new()),
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => None,
    }
}

/// Slice of the first `{...}` whose braces balance, ignoring braces inside strings.
pub fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Strip `<think>...</think>` and `<thinking>...</thinking>` blocks.
pub fn strip_thinking_tags(text: &str) -> String {
    let mut result = text.to_string();

    for (open_tag, close_tag) in [("<thinking>", "</thinking>"), ("<think>", "</think>")] {
        while let Some(start) = result.find(open_tag) {
            if let Some(end) = result[start..].find(close_tag) {
                let end_pos = start + end + close_tag.len();
                result.replace_range(start..end_pos, "");
            } else {
                // Unclosed: everything after the tag is scratch work.
                result.truncate(start);
            }
        }
    }

    result.trim().to_string()
}
