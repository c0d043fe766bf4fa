//! Session backed by an Ollama daemon over HTTP.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{GenerationRequest, GenerationResponse, ModelBackend, ModelError, ModelInformation};

pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

/// Connection settings for the Ollama daemon; the `[ollama]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaOptions {
    pub host: String,
    pub request_timeout_secs: u64,
}

impl Default for OllamaOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_OLLAMA_HOST.to_owned(),
            request_timeout_secs: 300,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f64,
    top_k: i64,
    top_p: f64,
    min_p: f64,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    model: Option<String>,
}

/// A model served by Ollama. The daemon owns the weights, so `load` and
/// `unload` have nothing to do here.
#[derive(Debug)]
pub struct RemoteSession {
    info: ModelInformation,
    host: String,
    client: Client,
}

impl RemoteSession {
    pub fn new(info: ModelInformation, options: &OllamaOptions) -> Result<Self, ModelError> {
        // The daemon is a local or LAN service; system proxies never apply.
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(options.request_timeout_secs))
            .build()
            .map_err(|err| ModelError::Load {
                model: info.name.clone(),
                source: anyhow::Error::new(err).context("failed to build HTTP client"),
            })?;
        debug!(model = %info.name, host = %options.host, "remote session created");
        Ok(Self {
            info,
            host: options.host.trim_end_matches('/').to_owned(),
            client,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn listed_models(&self) -> anyhow::Result<Vec<TagEntry>> {
        let tags: TagsResponse = self
            .client
            .get(format!("{}/api/tags", self.host))
            .send()?
            .error_for_status()?
            .json()?;
        Ok(tags.models)
    }

    fn chat(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        let body = ChatRequest {
            model: &self.info.name,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            stream: false,
            options: ChatOptions {
                temperature: request.temperature,
                top_k: request.top_k,
                top_p: request.top_p,
                min_p: request.min_p,
            },
        };
        let response: ChatResponse = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&body)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(response.message.content)
    }
}

impl ModelBackend for RemoteSession {
    fn model_info(&self) -> &ModelInformation {
        &self.info
    }

    /// Whether the daemon lists this model; unreachable daemons count as not
    /// loaded.
    fn is_loaded(&self) -> bool {
        match self.listed_models() {
            Ok(models) => models.iter().any(|entry| {
                entry.name == self.info.name || entry.model.as_deref() == Some(&self.info.name)
            }),
            Err(err) => {
                warn!(model = %self.info.name, error = %err, "failed to query ollama model list");
                false
            }
        }
    }

    fn load(&mut self) -> Result<(), ModelError> {
        debug!(model = %self.info.name, "ollama loads models on first request");
        Ok(())
    }

    fn unload(&mut self) {
        debug!(model = %self.info.name, "ollama manages model residency");
    }

    fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationResponse, ModelError> {
        debug!(
            model = %self.info.name,
            host = %self.host,
            temperature = request.temperature,
            "sending chat request"
        );
        let text = self.chat(request).map_err(|source| ModelError::Generation {
            model: self.info.name.clone(),
            source,
        })?;
        let metadata = BTreeMap::from([
            ("model_name".to_owned(), self.info.name.clone()),
            ("character_count".to_owned(), text.chars().count().to_string()),
        ]);
        Ok(GenerationResponse {
            text,
            metadata,
            request: request.clone(),
        })
    }
}
