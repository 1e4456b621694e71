//! Persona store — the AI characters a session can be bound to.
//!
//! DESIGN
//! ======
//! Personas are plain data with one shared shape. The store is read-only at
//! runtime: `StaticPersonaStore` loads a JSON array from `PERSONAS_FILE` at
//! startup or falls back to a small built-in roster.

use std::path::Path;

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    /// One-line personality summary, always part of the system instruction.
    pub personality: String,
    /// Optional longer background.
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersonaError {
    #[error("persona not found: {0}")]
    NotFound(String),
    #[error("no personas available")]
    Empty,
    #[error("persona load failed: {0}")]
    Load(String),
}

impl crate::frame::ErrorCode for PersonaError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_PERSONA_NOT_FOUND",
            Self::Empty => "E_NO_PERSONAS",
            Self::Load(_) => "E_PERSONA_LOAD",
        }
    }
}

/// Read access to the persona roster.
pub trait PersonaStore: Send + Sync {
    /// Look up one persona by id.
    ///
    /// # Errors
    ///
    /// Returns [`PersonaError::NotFound`] for unknown ids.
    fn get(&self, id: &str) -> Result<Persona, PersonaError>;

    fn list(&self) -> Vec<Persona>;

    /// Pick a random persona other than `exclude`. When the exclusion would
    /// leave nothing to pick from, any persona is returned.
    ///
    /// # Errors
    ///
    /// Returns [`PersonaError::Empty`] if the roster is empty.
    fn random_excluding(&self, exclude: Option<&str>) -> Result<Persona, PersonaError>;
}

// =============================================================================
// STATIC STORE
// =============================================================================

pub struct StaticPersonaStore {
    personas: Vec<Persona>,
}

impl StaticPersonaStore {
    #[must_use]
    pub fn new(personas: Vec<Persona>) -> Self {
        Self { personas }
    }

    /// Load a JSON array of personas from disk.
    ///
    /// # Errors
    ///
    /// Returns [`PersonaError::Load`] if the file is unreadable or malformed,
    /// and [`PersonaError::Empty`] if it holds no personas.
    pub fn from_file(path: &Path) -> Result<Self, PersonaError> {
        let raw = std::fs::read_to_string(path).map_err(|e| PersonaError::Load(format!("{}: {e}", path.display())))?;
        let personas: Vec<Persona> =
            serde_json::from_str(&raw).map_err(|e| PersonaError::Load(format!("{}: {e}", path.display())))?;
        if personas.is_empty() {
            return Err(PersonaError::Empty);
        }
        Ok(Self::new(personas))
    }

    /// `PERSONAS_FILE` when set and loadable, otherwise the built-in roster.
    #[must_use]
    pub fn from_env() -> Self {
        let Ok(path) = std::env::var("PERSONAS_FILE") else {
            return Self::builtin();
        };
        match Self::from_file(Path::new(&path)) {
            Ok(store) => {
                tracing::info!(%path, count = store.personas.len(), "personas loaded");
                store
            }
            Err(e) => {
                tracing::warn!(%path, error = %e, "persona file unusable, using built-in roster");
                Self::builtin()
            }
        }
    }

    #[must_use]
    pub fn builtin() -> Self {
        let persona = |id: &str, name: &str, personality: &str, description: &str| Persona {
            id: id.into(),
            name: name.into(),
            avatar: Some(format!("/avatars/{id}.png")),
            personality: personality.into(),
            description: Some(description.into()),
        };
        Self::new(vec![
            persona(
                "mira",
                "Mira",
                "warm, curious, asks follow-up questions",
                "A night-shift nurse who collects odd facts about the ocean.",
            ),
            persona(
                "jonah",
                "Jonah",
                "dry humor, laid back, a little sarcastic",
                "A bike mechanic who plays bass in a band nobody has heard of.",
            ),
            persona(
                "priya",
                "Priya",
                "energetic, direct, loves a good debate",
                "A grad student in urban planning with strong opinions about trains.",
            ),
            persona(
                "theo",
                "Theo",
                "gentle, thoughtful, speaks in short sentences",
                "A retired schoolteacher who keeps bees and reads too many mysteries.",
            ),
        ])
    }
}

impl PersonaStore for StaticPersonaStore {
    fn get(&self, id: &str) -> Result<Persona, PersonaError> {
        self.personas
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| PersonaError::NotFound(id.to_string()))
    }

    fn list(&self) -> Vec<Persona> {
        self.personas.clone()
    }

    fn random_excluding(&self, exclude: Option<&str>) -> Result<Persona, PersonaError> {
        let candidates: Vec<&Persona> = self
            .personas
            .iter()
            .filter(|p| Some(p.id.as_str()) != exclude)
            .collect();
        let mut rng = rand::rng();
        let picked = if candidates.is_empty() { self.personas.choose(&mut rng) } else { candidates.choose(&mut rng).copied() };
        picked.cloned().ok_or(PersonaError::Empty)
    }
}

#[cfg(test)]
#[path = "persona_test.rs"]
mod tests;
