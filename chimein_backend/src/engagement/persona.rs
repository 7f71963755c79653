use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::PersonaIdentity;

/// A named character the pipeline can speak as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub color: String,
    /// Voice definition, passed to the generation oracle verbatim.
    pub prompt: String,
}

impl Persona {
    pub fn identity(&self) -> PersonaIdentity {
        PersonaIdentity {
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            color: self.color.clone(),
        }
    }
}

pub trait PersonaRoster: Send + Sync {
    fn list_personas(&self) -> Result<Vec<Persona>>;
}

/// Case-insensitive exact name match. No fuzzy fallback: an ambiguous or
/// misspelled name is a miss.
pub fn resolve_persona<'a>(name: &str, roster: &'a [Persona]) -> Option<&'a Persona> {
    let wanted = name.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    roster
        .iter()
        .find(|persona| persona.name.trim().to_lowercase() == wanted)
}
