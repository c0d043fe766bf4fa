//! Model backend sessions.
//!
//! A session is one model on one provider. [`LocalSession`] runs GGUF weights
//! in-process; [`RemoteSession`] forwards requests to an Ollama daemon. Both
//! are reached through the [`ModelBackend`] trait, and [`BackendSession`] is
//! the closed set the standard factory produces.

mod local;
mod remote;

#[cfg(test)]
pub(crate) mod mock;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

pub use local::{LocalSession, min_p_mask};
pub use remote::{DEFAULT_OLLAMA_HOST, OllamaOptions, RemoteSession};

/// Which runtime serves a model.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
pub enum Provider {
    /// GGUF weights loaded into this process.
    #[default]
    #[serde(rename = "llama-cpp")]
    #[strum(serialize = "llama-cpp")]
    LlamaCpp,
    /// A model served by a local Ollama daemon.
    #[serde(rename = "ollama")]
    #[strum(serialize = "ollama")]
    Ollama,
}

/// Static description of a model: where it lives, how to wrap prompts for
/// it and its sampling defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelInformation {
    pub name: String,
    pub provider: Provider,
    pub repository_id: String,
    pub file_name: String,
    /// Tokenizer location relative to the models directory.
    pub tokenizer_file: Option<String>,
    pub output_length: usize,
    /// Upper bound on generated tokens for in-process generation.
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_k: i64,
    pub top_p: f64,
    pub min_p: f64,
    pub system_prompt_prefix: String,
    pub user_prompt_prefix: String,
    pub user_prompt_suffix: String,
}

impl Default for ModelInformation {
    fn default() -> Self {
        Self {
            name: String::new(),
            provider: Provider::LlamaCpp,
            repository_id: String::new(),
            file_name: String::new(),
            tokenizer_file: None,
            output_length: 32768,
            max_tokens: 2048,
            temperature: 0.5,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            system_prompt_prefix: String::new(),
            user_prompt_prefix: String::new(),
            user_prompt_suffix: String::new(),
        }
    }
}

impl ModelInformation {
    /// Defaults for `name` on `provider`.
    pub fn named(name: impl Into<String>, provider: Provider) -> Self {
        Self {
            name: name.into(),
            provider,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f64,
    pub top_k: i64,
    pub top_p: f64,
    pub min_p: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub request: GenerationRequest,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no model selected for provider {provider}")]
    NoModelSelected { provider: Provider },

    #[error("model '{name}' is not registered for provider {provider}")]
    UnknownModel { provider: Provider, name: String },

    #[error("failed to load model '{model}': {source:#}")]
    Load {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("generation failed for model '{model}': {source:#}")]
    Generation {
        model: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Common contract of every backend session.
///
/// `load` is idempotent, `unload` never fails, and `generate` loads on
/// demand. `model_info` stays available while unloaded.
pub trait ModelBackend: Send {
    fn model_info(&self) -> &ModelInformation;

    fn is_loaded(&self) -> bool;

    fn load(&mut self) -> Result<(), ModelError>;

    fn unload(&mut self);

    fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationResponse, ModelError>;
}

/// The two session kinds produced by [`crate::lifecycle::StandardSessionFactory`].
#[derive(Debug)]
pub enum BackendSession {
    Local(LocalSession),
    Remote(RemoteSession),
}

impl ModelBackend for BackendSession {
    fn model_info(&self) -> &ModelInformation {
        match self {
            BackendSession::Local(s) => s.model_info(),
            BackendSession::Remote(s) => s.model_info(),
        }
    }

    fn is_loaded(&self) -> bool {
        match self {
            BackendSession::Local(s) => s.is_loaded(),
            BackendSession::Remote(s) => s.is_loaded(),
        }
    }

    fn load(&mut self) -> Result<(), ModelError> {
        match self {
            BackendSession::Local(s) => s.load(),
            BackendSession::Remote(s) => s.load(),
        }
    }

    fn unload(&mut self) {
        match self {
            BackendSession::Local(s) => s.unload(),
            BackendSession::Remote(s) => s.unload(),
        }
    }

    fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationResponse, ModelError> {
        match self {
            BackendSession::Local(s) => s.generate(request),
            BackendSession::Remote(s) => s.generate(request),
        }
    }
}

/// Known models, looked up by provider and name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRegistry {
    models: Vec<ModelInformation>,
}

impl ModelRegistry {
    pub fn new(models: Vec<ModelInformation>) -> Self {
        Self { models }
    }

    /// Models the application ships presets for.
    pub fn builtin() -> Self {
        Self::new(vec![
            ModelInformation {
                repository_id: "unsloth/gemma-3n-E4B-it-GGUF".into(),
                file_name: "gemma-3n-E4B-it-Q4_K_M.gguf".into(),
                system_prompt_prefix: "<start_of_turn>user\n".into(),
                user_prompt_suffix: "<end_of_turn>\n<start_of_turn>model\n".into(),
                ..ModelInformation::named(crate::settings::DEFAULT_MODEL_NAME, Provider::LlamaCpp)
            },
            ModelInformation {
                repository_id: "Qwen/Qwen3-4B-GGUF".into(),
                file_name: "Qwen3-4B-Q4_K_M.gguf".into(),
                temperature: 0.6,
                top_k: 20,
                min_p: 0.0,
                system_prompt_prefix: "<|im_start|>system\n".into(),
                user_prompt_prefix: "<|im_end|>\n<|im_start|>user".into(),
                user_prompt_suffix: "<|im_end|>\n<|im_start|>assistant".into(),
                ..ModelInformation::named("qwen3-4b", Provider::LlamaCpp)
            },
        ])
    }

    pub fn find(&self, provider: Provider, name: &str) -> Option<&ModelInformation> {
        self.models
            .iter()
            .find(|model| model.provider == provider && model.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelInformation> {
        self.models.iter()
    }

    /// In-process models whose weight file exists under `models_dir`,
    /// sorted by name.
    pub fn available_local(&self, models_dir: &Path) -> Vec<&ModelInformation> {
        let mut found: Vec<_> = self
            .models
            .iter()
            .filter(|model| model.provider == Provider::LlamaCpp)
            .filter(|model| models_dir.join(&model.file_name).is_file())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }
}

impl fmt::Display for ModelInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}
