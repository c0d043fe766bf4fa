//! Generation pipeline: prompt + parameters in, cleaned model output out.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::{GenerationRequest, ModelBackend, ModelError, ModelInformation};
use crate::lifecycle::{ModelLifecycle, SessionFactory, SessionKey};
use crate::prompt::{
    self, PARAM_INPUT_LANGUAGE, PARAM_OUTPUT_LANGUAGE, PARAM_USER_TEXT, PromptCatalog,
    PromptError, SYSTEM_PROMPT_ID,
};
use crate::sanitize::Sanitizer;
use crate::settings::{SettingsProvider, SettingsState};
use crate::task::{CancelToken, Task, TaskId};

/// What to run: a prompt id and the values for its placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingContext {
    pub prompt_id: String,
    pub parameters: BTreeMap<String, String>,
}

impl ProcessingContext {
    pub fn new(prompt_id: impl Into<String>, parameters: BTreeMap<String, String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            parameters,
        }
    }

    /// Context for prompts that only take the user's text.
    pub fn for_text(prompt_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            prompt_id,
            BTreeMap::from([(PARAM_USER_TEXT.to_owned(), text.into())]),
        )
    }

    pub fn for_translation(
        prompt_id: impl Into<String>,
        text: impl Into<String>,
        input_language: impl Into<String>,
        output_language: impl Into<String>,
    ) -> Self {
        Self::new(
            prompt_id,
            BTreeMap::from([
                (PARAM_USER_TEXT.to_owned(), text.into()),
                (PARAM_INPUT_LANGUAGE.to_owned(), input_language.into()),
                (PARAM_OUTPUT_LANGUAGE.to_owned(), output_language.into()),
            ]),
        )
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("operation canceled")]
    Canceled,
}

/// Runs one processing request at a time against the active model session.
///
/// The session is only swapped inside [`ModelLifecycle::session`], which runs
/// under the same lock as generation, so a session is never replaced while a
/// request against it is in flight.
pub struct GenerationPipeline<F: SessionFactory> {
    catalog: Arc<PromptCatalog>,
    settings: Arc<dyn SettingsProvider>,
    lifecycle: Mutex<ModelLifecycle<F>>,
    sanitizer: Sanitizer,
    system_prompt_id: String,
}

impl<F: SessionFactory> GenerationPipeline<F> {
    pub fn new(
        catalog: Arc<PromptCatalog>,
        settings: Arc<dyn SettingsProvider>,
        factory: F,
    ) -> Self {
        let lifecycle = ModelLifecycle::new(factory, Arc::clone(&settings));
        Self {
            catalog,
            settings,
            lifecycle: Mutex::new(lifecycle),
            sanitizer: Sanitizer::default(),
            system_prompt_id: SYSTEM_PROMPT_ID.to_owned(),
        }
    }

    pub fn with_system_prompt(mut self, prompt_id: impl Into<String>) -> Self {
        self.system_prompt_id = prompt_id.into();
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn catalog(&self) -> &PromptCatalog {
        &self.catalog
    }

    /// Run `ctx` and return the sanitized model output.
    pub fn process(&self, ctx: &ProcessingContext) -> Result<String, PipelineError> {
        self.process_with_cancel(ctx, &CancelToken::never())
    }

    /// As [`Self::process`], checking `cancel` before loading and before
    /// generating. A generation already in flight is not interrupted.
    pub fn process_with_cancel(
        &self,
        ctx: &ProcessingContext,
        cancel: &CancelToken,
    ) -> Result<String, PipelineError> {
        info!(prompt_id = %ctx.prompt_id, "processing request");
        let mut lifecycle = self.lock_lifecycle();
        let session = lifecycle.session()?;

        if cancel.is_canceled() {
            return Err(PipelineError::Canceled);
        }
        if !session.is_loaded() {
            session.load()?;
        }

        let system = self.catalog.get(&self.system_prompt_id)?;
        let user = self.catalog.get(&ctx.prompt_id)?;
        prompt::validate(user, &ctx.parameters)?;

        let rendered = prompt::apply(user, &ctx.parameters);
        let request = build_request(
            session.model_info(),
            &self.settings.snapshot(),
            &system.template,
            &rendered,
        );

        if cancel.is_canceled() {
            return Err(PipelineError::Canceled);
        }
        let response = session.generate(&request)?;
        debug!(
            prompt_id = %ctx.prompt_id,
            raw_len = response.text.len(),
            "generation complete"
        );
        Ok(self.sanitizer.sanitize(&response.text))
    }

    /// [`Self::process`] that logs any failure and returns an empty string.
    pub fn process_or_empty(&self, ctx: &ProcessingContext) -> String {
        self.process(ctx).unwrap_or_else(|err| {
            error!(prompt_id = %ctx.prompt_id, error = %err, "processing failed");
            String::new()
        })
    }

    pub fn active_session(&self) -> Option<SessionKey> {
        self.lock_lifecycle().active_key().cloned()
    }

    pub fn watch_active_session(&self) -> watch::Receiver<Option<SessionKey>> {
        self.lock_lifecycle().watch_active()
    }

    /// Unload the active session; used at shutdown.
    pub fn unload(&self) {
        self.lock_lifecycle().unload_active();
    }

    /// A request that panicked mid-generation leaves the lock poisoned and
    /// its session in an unknown state; drop that session and carry on.
    fn lock_lifecycle(&self) -> MutexGuard<'_, ModelLifecycle<F>> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                let mut guard = poisoned.into_inner();
                warn!(
                    session = ?guard.active_key(),
                    "previous request panicked, discarding model session"
                );
                guard.unload_active();
                self.lifecycle.clear_poison();
                guard
            }
        }
    }
}

/// Wrap the model's prompt format around the templates and pick sampling
/// values; the user's temperature wins only when enabled.
pub(crate) fn build_request(
    model: &ModelInformation,
    settings: &SettingsState,
    system_template: &str,
    rendered: &str,
) -> GenerationRequest {
    let temperature = if settings.temperature_enabled {
        settings.temperature
    } else {
        model.temperature
    };
    GenerationRequest {
        system_prompt: format!("{}{}", model.system_prompt_prefix, system_template),
        user_prompt: format!(
            "{}\n{}\n{}",
            model.user_prompt_prefix, rendered, model.user_prompt_suffix
        ),
        temperature,
        top_k: model.top_k,
        top_p: model.top_p,
        min_p: model.min_p,
    }
}

/// Task that runs `ctx` through `pipeline` on a worker.
pub fn into_task<F>(
    pipeline: Arc<GenerationPipeline<F>>,
    id: impl Into<TaskId>,
    ctx: ProcessingContext,
) -> Task
where
    F: SessionFactory + 'static,
{
    Task::new(id, move |cancel| {
        pipeline
            .process_with_cancel(&ctx, &cancel)
            .map_err(anyhow::Error::from)
    })
}
