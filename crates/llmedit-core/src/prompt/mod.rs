//! Prompt templates: catalog lookup, parameter validation and substitution.

mod builtin;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::debug;

pub use builtin::{
    PARAM_INPUT_LANGUAGE, PARAM_OUTPUT_LANGUAGE, PARAM_USER_TEXT, SYSTEM_PROMPT_ID,
    supported_translation_languages,
};

/// Kind of operation a prompt performs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PromptCategory {
    System,
    Proofread,
    Format,
    Translate,
}

/// A named template with `{{name}}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: PromptCategory,
    pub template: String,
    /// Required parameter names, in declaration order.
    #[serde(default)]
    pub parameters: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("prompt not found: {id}")]
    NotFound { id: String },

    #[error("prompt '{prompt_id}' is missing parameters: {}", missing.join(", "))]
    Validation {
        prompt_id: String,
        missing: Vec<String>,
    },

    #[error("duplicate prompt id: {id}")]
    Duplicate { id: String },
}

/// Read-only set of prompts, looked up by exact id.
#[derive(Debug, Clone, Default)]
pub struct PromptCatalog {
    prompts: Vec<Prompt>,
}

impl PromptCatalog {
    /// Build a catalog, rejecting repeated ids.
    pub fn from_prompts(prompts: impl IntoIterator<Item = Prompt>) -> Result<Self, PromptError> {
        let mut seen = HashSet::new();
        let mut collected = Vec::new();
        for prompt in prompts {
            if !seen.insert(prompt.id.clone()) {
                return Err(PromptError::Duplicate { id: prompt.id });
            }
            collected.push(prompt);
        }
        debug!(count = collected.len(), "prompt catalog built");
        Ok(Self {
            prompts: collected,
        })
    }

    /// The application's own prompts.
    pub fn builtin() -> Self {
        Self {
            prompts: builtin::prompts(),
        }
    }

    pub fn get(&self, id: &str) -> Result<&Prompt, PromptError> {
        self.prompts
            .iter()
            .find(|prompt| prompt.id == id)
            .ok_or_else(|| PromptError::NotFound { id: id.to_owned() })
    }

    pub fn by_category(&self, category: PromptCategory) -> Vec<&Prompt> {
        self.prompts
            .iter()
            .filter(|prompt| prompt.category == category)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Prompt> {
        self.prompts.iter()
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

/// Required parameter names absent from `provided`, in declaration order.
pub fn missing_parameters<'a>(
    prompt: &'a Prompt,
    provided: &BTreeMap<String, String>,
) -> Vec<&'a str> {
    prompt
        .parameters
        .iter()
        .filter(|name| !provided.contains_key(name.as_str()))
        .map(String::as_str)
        .collect()
}

/// Succeeds iff every required parameter is present. Extra keys are ignored
/// and values are not inspected.
pub fn validate(prompt: &Prompt, provided: &BTreeMap<String, String>) -> Result<(), PromptError> {
    let missing = missing_parameters(prompt, provided);
    if missing.is_empty() {
        return Ok(());
    }
    Err(PromptError::Validation {
        prompt_id: prompt.id.clone(),
        missing: missing.into_iter().map(str::to_owned).collect(),
    })
}

/// Replace each `{{name}}` whose `name` is a key of `provided` with its value.
///
/// The template is scanned once from left to right, so substituted values are
/// never re-expanded and key order has no effect. Unknown placeholders are
/// left untouched.
pub fn apply(prompt: &Prompt, provided: &BTreeMap<String, String>) -> String {
    let template = prompt.template.as_str();
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let tail = &rest[start..];
        let hit = provided.iter().find(|(key, _)| {
            tail[2..]
                .strip_prefix(key.as_str())
                .is_some_and(|after| after.starts_with("}}"))
        });
        match hit {
            Some((key, value)) => {
                rendered.push_str(value);
                rest = &tail[key.len() + 4..];
            }
            None => {
                rendered.push('{');
                rest = &tail[1..];
            }
        }
    }
    rendered.push_str(rest);
    rendered
}
