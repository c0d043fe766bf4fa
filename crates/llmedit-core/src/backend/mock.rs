//! In-memory sessions for unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    GenerationRequest, GenerationResponse, ModelBackend, ModelError, ModelInformation, Provider,
};
use crate::lifecycle::{SessionFactory, SessionKey};

type Reply = Arc<dyn Fn(&GenerationRequest) -> Result<String, String> + Send + Sync>;

#[derive(Default)]
pub(crate) struct MockStats {
    pub created: AtomicUsize,
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub generates: AtomicUsize,
    pub keys: Mutex<Vec<SessionKey>>,
    pub last_request: Mutex<Option<GenerationRequest>>,
}

impl MockStats {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockSession {
    info: ModelInformation,
    loaded: bool,
    stats: Arc<MockStats>,
    reply: Reply,
}

impl ModelBackend for MockSession {
    fn model_info(&self) -> &ModelInformation {
        &self.info
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn load(&mut self) -> Result<(), ModelError> {
        if !self.loaded {
            self.stats.loads.fetch_add(1, Ordering::SeqCst);
            self.loaded = true;
        }
        Ok(())
    }

    fn unload(&mut self) {
        if self.loaded {
            self.stats.unloads.fetch_add(1, Ordering::SeqCst);
            self.loaded = false;
        }
    }

    fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationResponse, ModelError> {
        self.load()?;
        self.stats.generates.fetch_add(1, Ordering::SeqCst);
        *self.stats.last_request.lock().unwrap() = Some(request.clone());
        let text = (self.reply)(request).map_err(|msg| ModelError::Generation {
            model: self.info.name.clone(),
            source: anyhow::anyhow!(msg),
        })?;
        Ok(GenerationResponse {
            text,
            metadata: BTreeMap::from([("model_name".to_owned(), self.info.name.clone())]),
            request: request.clone(),
        })
    }
}

/// Creates [`MockSession`]s for any name, or only for `known` names when set.
pub(crate) struct MockFactory {
    pub stats: Arc<MockStats>,
    known: Option<Vec<String>>,
    template: ModelInformation,
    reply: Reply,
}

impl MockFactory {
    /// Sessions echo the user prompt.
    pub fn echo() -> Self {
        Self::replying(|request| Ok(request.user_prompt.clone()))
    }

    pub fn replying(
        reply: impl Fn(&GenerationRequest) -> Result<String, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            stats: Arc::default(),
            known: None,
            template: ModelInformation::default(),
            reply: Arc::new(reply),
        }
    }

    pub fn with_known(mut self, names: &[&str]) -> Self {
        self.known = Some(names.iter().map(|n| (*n).to_owned()).collect());
        self
    }

    pub fn with_template(mut self, template: ModelInformation) -> Self {
        self.template = template;
        self
    }
}

impl SessionFactory for MockFactory {
    type Session = MockSession;

    fn create(&self, key: &SessionKey) -> Result<MockSession, ModelError> {
        if let Some(known) = &self.known {
            if !known.contains(&key.model_name) {
                return Err(ModelError::UnknownModel {
                    provider: key.provider,
                    name: key.model_name.clone(),
                });
            }
        }
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        self.stats.keys.lock().unwrap().push(key.clone());
        Ok(MockSession {
            info: ModelInformation {
                name: key.model_name.clone(),
                provider: key.provider,
                ..self.template.clone()
            },
            loaded: false,
            stats: Arc::clone(&self.stats),
            reply: Arc::clone(&self.reply),
        })
    }
}

pub(crate) fn key(provider: Provider, name: &str) -> SessionKey {
    SessionKey {
        provider,
        model_name: name.to_owned(),
    }
}
