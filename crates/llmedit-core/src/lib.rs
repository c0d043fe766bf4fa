//! llmedit-core: background text-editing runtime.
//!
//! Three layers cooperate here:
//!
//! - [`task`]: an asynchronous task service that runs blocking jobs off the
//!   caller's thread and routes completions to per-task callbacks and global
//!   listeners while broadcasting a busy flag.
//! - [`lifecycle`]: owns at most one model session at a time and swaps it
//!   when the configured provider or model changes.
//! - [`pipeline`]: turns a prompt id plus parameters into a model request,
//!   runs it and cleans up the response.
//!
//! [`prompt`], [`backend`], [`settings`] and [`config`] supply the data those
//! layers operate on.

pub mod backend;
pub mod config;
pub mod lifecycle;
pub mod pipeline;
pub mod prompt;
pub mod sanitize;
pub mod settings;
pub mod task;

pub use backend::{
    BackendSession, GenerationRequest, GenerationResponse, ModelBackend, ModelError,
    ModelInformation, ModelRegistry, Provider,
};
pub use config::{Config, ConfigError};
pub use lifecycle::{ModelLifecycle, SessionFactory, SessionKey, StandardSessionFactory};
pub use pipeline::{GenerationPipeline, PipelineError, ProcessingContext, into_task};
pub use prompt::{Prompt, PromptCatalog, PromptCategory, PromptError};
pub use sanitize::Sanitizer;
pub use settings::{InMemorySettings, SettingsProvider, SettingsState};
pub use task::{
    CancelToken, Task, TaskError, TaskResult, TaskService, TaskServiceConfig, TaskState,
};
