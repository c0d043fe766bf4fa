//! Configuration, loaded from a TOML file with environment overrides.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::backend::{ModelInformation, ModelRegistry, OllamaOptions, Provider};
use crate::prompt::{Prompt, PromptCatalog, PromptError};
use crate::settings::{DEFAULT_MODEL_NAME, SettingsState};
use crate::task::TaskServiceConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub llm: LlmConfig,
    pub paths: PathsConfig,
    pub ollama: OllamaOptions,
    pub log: LogConfig,
    /// Model registry; the built-in presets apply when empty.
    pub models: Vec<ModelInformation>,
    /// Prompt catalog; the built-in prompts apply when empty.
    pub prompts: Vec<Prompt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Blocking workers that run task bodies.
    pub workers: usize,
    /// Maximum number of live (queued or running) tasks.
    pub queue_capacity: usize,
    pub task_timeout_secs: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 16,
            task_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: Provider,
    pub model: Option<String>,
    pub temperature: f64,
    pub temperature_enabled: bool,
    pub source_language: String,
    pub target_language: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Provider::LlamaCpp,
            model: Some(DEFAULT_MODEL_NAME.to_owned()),
            temperature: 0.5,
            temperature_enabled: false,
            source_language: "English".to_owned(),
            target_language: "German".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter string, e.g. `"info"` or `"llmedit_core=debug"`.
    pub level: String,
    /// Emit newline-delimited JSON records.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

impl Config {
    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.apply_env();
        config.validate()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        self.log.level = env_or("LLMEDIT_LOG", &self.log.level);
        self.log.json = std::env::var("LLMEDIT_LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(self.log.json);
        if let Ok(dir) = std::env::var("LLMEDIT_MODELS_DIR") {
            self.paths.models_dir = PathBuf::from(dir);
        }
        self.ollama.host = env_or("LLMEDIT_OLLAMA_HOST", &self.ollama.host);
        self.runtime.workers = parse_env("LLMEDIT_WORKERS", self.runtime.workers);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.workers == 0 {
            return Err(ConfigError::Invalid("runtime.workers must be at least 1".into()));
        }
        if self.runtime.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "runtime.queue_capacity must be at least 1".into(),
            ));
        }
        if self.runtime.task_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "runtime.task_timeout_secs must be positive when set".into(),
            ));
        }
        if let Some(model) = self.models.iter().find(|m| m.name.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "model entry for file '{}' has no name",
                model.file_name
            )));
        }
        Ok(())
    }

    pub fn registry(&self) -> ModelRegistry {
        if self.models.is_empty() {
            ModelRegistry::builtin()
        } else {
            ModelRegistry::new(self.models.clone())
        }
    }

    pub fn catalog(&self) -> Result<PromptCatalog, PromptError> {
        if self.prompts.is_empty() {
            Ok(PromptCatalog::builtin())
        } else {
            PromptCatalog::from_prompts(self.prompts.iter().cloned())
        }
    }

    pub fn settings_state(&self) -> SettingsState {
        SettingsState {
            provider: self.llm.provider,
            model_name: self.llm.model.clone(),
            temperature: self.llm.temperature,
            temperature_enabled: self.llm.temperature_enabled,
            source_language: self.llm.source_language.clone(),
            target_language: self.llm.target_language.clone(),
        }
    }

    pub fn task_service_config(&self) -> TaskServiceConfig {
        TaskServiceConfig {
            workers: self.runtime.workers,
            queue_capacity: self.runtime.queue_capacity,
            timeout: self.runtime.task_timeout_secs.map(Duration::from_secs),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
