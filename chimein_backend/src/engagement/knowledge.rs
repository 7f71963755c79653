use std::sync::Arc;

use super::{KnowledgeHit, RetrievalOracle};

pub const RETRIEVAL_TOP_K: usize = 3;
pub const MAX_KNOWLEDGE_SNIPPETS: usize = 2;
pub const SNIPPET_MAX_CHARS: usize = 500;
pub const QUERY_TAIL_CHARS: usize = 200;

/// Folds retrieved background knowledge into the generation context.
pub struct KnowledgeAugmenter {
    retrieval: Arc<dyn RetrievalOracle>,
}

impl KnowledgeAugmenter {
    pub fn new(retrieval: Arc<dyn RetrievalOracle>) -> Self {
        Self { retrieval }
    }

    /// Knowledge block for the generation prompt, or `None` when retrieval
    /// fails or finds nothing. Never an error: generation goes ahead without it.
    pub async fn augment(&self, persona_name: &str, transcript: &str) -> Option<String> {
        let query = build_query(persona_name, transcript);
        match self.retrieval.search(&query, RETRIEVAL_TOP_K).await {
            Ok(hits) => {
                let block = fold_snippets(&hits);
                if block.is_none() {
                    tracing::debug!("Retrieval returned no usable snippets for {}", persona_name);
                }
                block
            }
            Err(e) => {
                tracing::warn!(
                    "Knowledge retrieval failed for {}, continuing without it: {:#}",
                    persona_name,
                    e
                );
                None
            }
        }
    }
}

/// Persona name plus the tail of the transcript.
pub fn build_query(persona_name: &str, transcript: &str) -> String {
    format!("{} {}", persona_name.trim(), tail_chars(transcript, QUERY_TAIL_CHARS).trim())
        .trim()
        .to_string()
}

/// Framed as something the persona already knows, never as quotable sources.
pub fn fold_snippets(hits: &[KnowledgeHit]) -> Option<String> {
    let snippets: Vec<String> = hits
        .iter()
        .map(|hit| hit.text.trim())
        .filter(|text| !text.is_empty())
        .take(MAX_KNOWLEDGE_SNIPPETS)
        .map(|text| truncate_chars(text, SNIPPET_MAX_CHARS))
        .collect();

    if snippets.is_empty() {
        return None;
    }

    let mut block = String::from(
        "Things you already know that may be relevant (use naturally, in your own words; \
         do not quote them or mention sources):\n",
    );
    for snippet in snippets {
        block.push_str("- ");
        block.push_str(&snippet);
        block.push('\n');
    }
    Some(block.trim_end().to_string())
}

fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(max_chars).collect();
        truncated.push('…');
        truncated
    }
}
