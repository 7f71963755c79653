use std::sync::Arc;

use anyhow::{bail, Result};

use super::decision::{strip_thinking_tags, EngagementDecision};
use super::{CompletionOracle, CompletionRequest, Persona};

pub const GENERATION_MAX_TOKENS: u32 = 250;
/// Above the 0.7 used for factual answers: this is in-character flavor text.
pub const GENERATION_TEMPERATURE: f32 = 0.85;

pub struct ResponseGenerator {
    oracle: Arc<dyn CompletionOracle>,
}

impl ResponseGenerator {
    pub fn new(oracle: Arc<dyn CompletionOracle>) -> Self {
        Self { oracle }
    }

    /// Compose the persona's interjection. One oracle call, no retry.
    pub async fn generate(
        &self,
        persona: &Persona,
        transcript: &str,
        decision: &EngagementDecision,
        knowledge: Option<&str>,
    ) -> Result<String> {
        let request = CompletionRequest {
            system: Some(build_system_voice(persona)),
            prompt: build_generation_prompt(transcript, decision, knowledge),
            max_tokens: GENERATION_MAX_TOKENS,
            temperature: GENERATION_TEMPERATURE,
        };

        let raw = self.oracle.complete(request).await?;
        let response = clean_response(&raw, &persona.name);
        if response.is_empty() {
            bail!("generation oracle returned an empty response for {}", persona.name);
        }

        tracing::debug!("Generated {} chars as {}", response.chars().count(), persona.name);
        Ok(response)
    }
}

pub fn build_system_voice(persona: &Persona) -> String {
    format!(
        "{}\n\nIMPORTANT: Always speak in first person (I, me, my). \
         Never refer to yourself in the third person or as {}.",
        persona.prompt.trim(),
        persona.name
    )
}

pub fn build_generation_prompt(
    transcript: &str,
    decision: &EngagementDecision,
    knowledge: Option<&str>,
) -> String {
    let mut prompt = format!(
        "You are joining this ongoing group conversation uninvited, so keep it natural.\n\n\
         Conversation so far (oldest first):\n{}\n\n\
         Why you are chiming in: {}\n\
         Tone: {}\n",
        transcript,
        if decision.reason.is_empty() { "you have something to add" } else { &decision.reason },
        decision.response_tone
    );

    if let Some(knowledge) = knowledge {
        prompt.push('\n');
        prompt.push_str(knowledge);
        prompt.push('\n');
    }

    prompt.push_str(
        "\nWrite 1-3 sentences in character. Reply with the message text only, \
         without your name or quotation marks.",
    );
    prompt
}

/// Trim, drop think blocks and a leading speaker label, and defuse mass mentions.
pub fn clean_response(raw: &str, persona_name: &str) -> String {
    let mut text = strip_thinking_tags(raw);

    let label_pattern = format!(
        r"(?i)^\s*\**{}\**\s*:\s*",
        regex_lite::escape(persona_name.trim())
    );
    if let Ok(re) = regex_lite::Regex::new(&label_pattern) {
        text = re.replace(&text, "").into_owned();
    }

    if let Ok(re) = regex_lite::Regex::new(r"@(everyone|here)\b") {
        text = re.replace_all(&text, "@\u{200B}$1").into_owned();
    }

    let text = text.trim();
    let unquoted = text
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(text);
    unquoted.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engagement::decision::ResponseTone;
    use crate::engagement::fakes::ScriptedOracle;

    fn persona() -> Persona {
        Persona {
            name: "Elio".to_string(),
            avatar: String::new(),
            color: String::new(),
            prompt: "You are Elio, an earnest kid who loves space.".to_string(),
        }
    }

    fn decision() -> EngagementDecision {
        EngagementDecision {
            should_join: true,
            persona: "Elio".to_string(),
            reason: "they are talking about comets".to_string(),
            response_tone: ResponseTone::Excited,
        }
    }

    #[test]
    fn system_voice_keeps_persona_prompt_and_enforces_first_person() {
        let voice = build_system_voice(&persona());
        assert!(voice.starts_with("You are Elio, an earnest kid who loves space."));
        assert!(voice.contains("first person"));
    }

    #[test]
    fn prompt_includes_reason_tone_and_optional_knowledge() {
        let without = build_generation_prompt("ana: comet!", &decision(), None);
        assert!(without.contains("ana: comet!"));
        assert!(without.contains("they are talking about comets"));
        assert!(without.contains("Tone: excited"));
        assert!(!without.contains("Things you already know"));

        let with = build_generation_prompt(
            "ana: comet!",
            &decision(),
            Some("Things you already know:\n- tails"),
        );
        assert!(with.contains("- tails"));
    }

    #[test]
    fn cleans_labels_quotes_and_mass_mentions() {
        assert_eq!(clean_response("  Elio: Whoa, a comet!  ", "Elio"), "Whoa, a comet!");
        assert_eq!(clean_response("**elio**: hi", "Elio"), "hi");
        assert_eq!(clean_response("\"Quoted line\"", "Elio"), "Quoted line");
        assert_eq!(clean_response("hey @everyone look", "Elio"), "hey @\u{200B}everyone look");
        assert_eq!(clean_response("<think>plan</think>Hello", "Elio"), "Hello");
        assert_eq!(clean_response("Elio's here", "Elio"), "Elio's here");
    }

    #[tokio::test]
    async fn empty_generation_is_an_error() {
        let oracle = Arc::new(ScriptedOracle::new(vec![Ok("   ".to_string())]));
        let generator = ResponseGenerator::new(oracle);
        assert!(generator.generate(&persona(), "ana: hi", &decision(), None).await.is_err());
    }

    #[tokio::test]
    async fn uses_elevated_temperature_and_bounded_tokens() {
        let oracle = Arc::new(ScriptedOracle::new(vec![Ok("Comets are the best!".to_string())]));
        let generator = ResponseGenerator::new(oracle.clone());
        let text = generator
            .generate(&persona(), "ana: hi", &decision(), None)
            .await
            .expect("generated");
        assert_eq!(text, "Comets are the best!");

        let requests = oracle.requests();
        assert_eq!(requests[0].max_tokens, GENERATION_MAX_TOKENS);
        assert!(requests[0].temperature > 0.7);
        assert!(requests[0].system.as_deref().unwrap_or_default().contains("earnest kid"));
    }
}
