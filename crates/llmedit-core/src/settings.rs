//! User-adjustable generation settings.
//!
//! The pipeline and lifecycle manager never cache these values; they take a
//! fresh [`SettingsState`] snapshot on every request so a change made by the
//! user applies to the next operation.

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::backend::Provider;

pub const DEFAULT_MODEL_NAME: &str = "gemma-3n-E4B-it";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsState {
    pub provider: Provider,
    pub model_name: Option<String>,
    /// Used only when `temperature_enabled` is set; otherwise the model's
    /// own default applies.
    pub temperature: f64,
    pub temperature_enabled: bool,
    pub source_language: String,
    pub target_language: String,
}

impl Default for SettingsState {
    fn default() -> Self {
        Self {
            provider: Provider::LlamaCpp,
            model_name: Some(DEFAULT_MODEL_NAME.to_owned()),
            temperature: 0.5,
            temperature_enabled: false,
            source_language: "English".to_owned(),
            target_language: "German".to_owned(),
        }
    }
}

/// Source of the current settings.
pub trait SettingsProvider: Send + Sync {
    fn snapshot(&self) -> SettingsState;
}

/// Settings held in memory and changed through setters.
#[derive(Debug, Default)]
pub struct InMemorySettings {
    state: RwLock<SettingsState>,
}

impl InMemorySettings {
    pub fn new(state: SettingsState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Apply an arbitrary change under the write lock.
    pub fn update(&self, change: impl FnOnce(&mut SettingsState)) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        change(&mut guard);
    }

    pub fn set_provider(&self, provider: Provider) {
        self.update(|s| s.provider = provider);
    }

    pub fn set_model_name(&self, model_name: Option<String>) {
        self.update(|s| s.model_name = model_name);
    }

    pub fn set_temperature(&self, temperature: f64) {
        self.update(|s| s.temperature = temperature);
    }

    pub fn set_temperature_enabled(&self, enabled: bool) {
        self.update(|s| s.temperature_enabled = enabled);
    }

    pub fn set_languages(&self, source: impl Into<String>, target: impl Into<String>) {
        let (source, target) = (source.into(), target.into());
        self.update(|s| {
            s.source_language = source;
            s.target_language = target;
        });
    }
}

impl SettingsProvider for InMemorySettings {
    fn snapshot(&self) -> SettingsState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_application_defaults() {
        let s = SettingsState::default();
        assert_eq!(s.provider, Provider::LlamaCpp);
        assert_eq!(s.model_name.as_deref(), Some(DEFAULT_MODEL_NAME));
        assert!(!s.temperature_enabled);
        assert_eq!(s.temperature, 0.5);
    }

    #[test]
    fn setters_are_visible_in_next_snapshot() {
        let settings = InMemorySettings::default();
        let before = settings.snapshot();

        settings.set_provider(Provider::Ollama);
        settings.set_model_name(Some("llama3".into()));
        settings.set_temperature(0.9);
        settings.set_temperature_enabled(true);
        settings.set_languages("French", "Croatian");

        let after = settings.snapshot();
        assert_ne!(before, after);
        assert_eq!(after.provider, Provider::Ollama);
        assert_eq!(after.model_name.as_deref(), Some("llama3"));
        assert_eq!(after.temperature, 0.9);
        assert!(after.temperature_enabled);
        assert_eq!(after.source_language, "French");
        assert_eq!(after.target_language, "Croatian");
    }
}
