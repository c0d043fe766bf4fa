//! Model session lifecycle.
//!
//! [`ModelLifecycle`] keeps at most one session alive. Every call to
//! [`ModelLifecycle::session`] reads the current provider and model from the
//! settings; if they differ from the cached session's key, the old session is
//! unloaded before the new one is created.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::backend::{
    BackendSession, LocalSession, ModelBackend, ModelError, ModelInformation, ModelRegistry,
    OllamaOptions, Provider, RemoteSession,
};
use crate::config::Config;
use crate::settings::SettingsProvider;

/// Identity of a session: structural equality decides cache hits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub provider: Provider,
    pub model_name: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model_name)
    }
}

/// Builds a session for a key. Construction must not load the model.
pub trait SessionFactory: Send {
    type Session: ModelBackend;

    fn create(&self, key: &SessionKey) -> Result<Self::Session, ModelError>;
}

/// Resolves keys against a [`ModelRegistry`] and produces [`BackendSession`]s.
#[derive(Debug, Clone)]
pub struct StandardSessionFactory {
    registry: ModelRegistry,
    models_dir: PathBuf,
    ollama: OllamaOptions,
}

impl StandardSessionFactory {
    pub fn new(registry: ModelRegistry, models_dir: impl Into<PathBuf>, ollama: OllamaOptions) -> Self {
        Self {
            registry,
            models_dir: models_dir.into(),
            ollama,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.registry(),
            config.paths.models_dir.clone(),
            config.ollama.clone(),
        )
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }
}

impl SessionFactory for StandardSessionFactory {
    type Session = BackendSession;

    fn create(&self, key: &SessionKey) -> Result<BackendSession, ModelError> {
        match key.provider {
            Provider::LlamaCpp => {
                let info = self
                    .registry
                    .find(Provider::LlamaCpp, &key.model_name)
                    .cloned()
                    .ok_or_else(|| ModelError::UnknownModel {
                        provider: key.provider,
                        name: key.model_name.clone(),
                    })?;
                Ok(BackendSession::Local(LocalSession::new(
                    info,
                    self.models_dir.clone(),
                )))
            }
            Provider::Ollama => {
                let info = self
                    .registry
                    .find(Provider::Ollama, &key.model_name)
                    .cloned()
                    .unwrap_or_else(|| ModelInformation::named(&key.model_name, Provider::Ollama));
                Ok(BackendSession::Remote(RemoteSession::new(info, &self.ollama)?))
            }
        }
    }
}

struct ActiveSession<S> {
    key: SessionKey,
    session: S,
}

/// Single-slot session cache keyed by provider and model name.
///
/// Not `Sync`: callers serialize access (the pipeline holds it in a `Mutex`).
pub struct ModelLifecycle<F: SessionFactory> {
    factory: F,
    settings: Arc<dyn SettingsProvider>,
    active: Option<ActiveSession<F::Session>>,
    active_tx: watch::Sender<Option<SessionKey>>,
}

impl<F: SessionFactory> ModelLifecycle<F> {
    pub fn new(factory: F, settings: Arc<dyn SettingsProvider>) -> Self {
        let (active_tx, _) = watch::channel(None);
        Self {
            factory,
            settings,
            active: None,
            active_tx,
        }
    }

    /// Session for the currently configured provider and model.
    ///
    /// A matching cached session is returned as is. Otherwise the cached one
    /// is unloaded and dropped first, so two sessions are never alive at once.
    pub fn session(&mut self) -> Result<&mut F::Session, ModelError> {
        let settings = self.settings.snapshot();
        let provider = settings.provider;

        let hit = matches!(
            (&self.active, settings.model_name.as_deref()),
            (Some(active), Some(name)) if active.key.provider == provider && active.key.model_name == name
        );

        if hit {
            debug!(provider = %provider, "session cache hit");
        } else {
            self.unload_active();

            let model_name = settings
                .model_name
                .filter(|name| !name.trim().is_empty())
                .ok_or(ModelError::NoModelSelected { provider })?;
            let key = SessionKey {
                provider,
                model_name,
            };
            info!(key = %key, "creating model session");
            let session = self.factory.create(&key)?;
            self.active_tx.send_replace(Some(key.clone()));
            self.active = Some(ActiveSession { key, session });
        }

        self.active
            .as_mut()
            .map(|active| &mut active.session)
            .ok_or(ModelError::NoModelSelected { provider })
    }

    pub fn active_key(&self) -> Option<&SessionKey> {
        self.active.as_ref().map(|active| &active.key)
    }

    /// Unload and drop the cached session, if any.
    pub fn unload_active(&mut self) {
        if let Some(mut previous) = self.active.take() {
            info!(key = %previous.key, "unloading previous session");
            previous.session.unload();
            self.active_tx.send_replace(None);
        }
    }

    /// Follow the key of the cached session.
    pub fn watch_active(&self) -> watch::Receiver<Option<SessionKey>> {
        self.active_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::backend::mock::{MockFactory, MockStats, key};
    use crate::settings::{InMemorySettings, SettingsState};

    fn settings(provider: Provider, model: Option<&str>) -> Arc<InMemorySettings> {
        Arc::new(InMemorySettings::new(SettingsState {
            provider,
            model_name: model.map(str::to_owned),
            ..SettingsState::default()
        }))
    }

    #[test]
    fn repeated_calls_return_the_cached_session() {
        let settings = settings(Provider::LlamaCpp, Some("a"));
        let factory = MockFactory::echo();
        let stats = Arc::clone(&factory.stats);
        let mut lifecycle = ModelLifecycle::new(factory, settings);

        let first: *const _ = lifecycle.session().unwrap();
        let second: *const _ = lifecycle.session().unwrap();
        assert_eq!(first, second);
        assert_eq!(MockStats::count(&stats.created), 1);
        assert_eq!(lifecycle.active_key(), Some(&key(Provider::LlamaCpp, "a")));
    }

    #[traced_test]
    #[test]
    fn model_change_unloads_previous_exactly_once() {
        let settings = settings(Provider::LlamaCpp, Some("a"));
        let factory = MockFactory::echo();
        let stats = Arc::clone(&factory.stats);
        let mut lifecycle = ModelLifecycle::new(factory, settings.clone());

        lifecycle.session().unwrap().load().unwrap();
        settings.set_model_name(Some("b".into()));
        let session = lifecycle.session().unwrap();
        assert_eq!(session.model_info().name, "b");
        assert!(!session.is_loaded());

        assert_eq!(MockStats::count(&stats.unloads), 1);
        assert_eq!(MockStats::count(&stats.created), 2);
        assert!(logs_contain("unloading previous session"));
    }

    #[test]
    fn provider_change_is_a_cache_miss() {
        let settings = settings(Provider::LlamaCpp, Some("same"));
        let factory = MockFactory::echo();
        let stats = Arc::clone(&factory.stats);
        let mut lifecycle = ModelLifecycle::new(factory, settings.clone());

        lifecycle.session().unwrap();
        settings.set_provider(Provider::Ollama);
        lifecycle.session().unwrap();

        let keys = stats.keys.lock().unwrap().clone();
        assert_eq!(
            keys,
            vec![key(Provider::LlamaCpp, "same"), key(Provider::Ollama, "same")]
        );
    }

    #[test]
    fn unset_model_fails_after_unloading_the_cache() {
        let settings = settings(Provider::Ollama, Some("a"));
        let factory = MockFactory::echo();
        let stats = Arc::clone(&factory.stats);
        let mut lifecycle = ModelLifecycle::new(factory, settings.clone());

        lifecycle.session().unwrap().load().unwrap();
        settings.set_model_name(None);

        assert!(matches!(
            lifecycle.session(),
            Err(ModelError::NoModelSelected {
                provider: Provider::Ollama
            })
        ));
        assert_eq!(MockStats::count(&stats.unloads), 1);
        assert!(lifecycle.active_key().is_none());
    }

    #[test]
    fn unknown_model_is_reported() {
        let settings = settings(Provider::LlamaCpp, Some("nope"));
        let mut lifecycle = ModelLifecycle::new(MockFactory::echo().with_known(&["a"]), settings);
        assert!(matches!(
            lifecycle.session(),
            Err(ModelError::UnknownModel { ref name, .. }) if name == "nope"
        ));
    }

    #[test]
    fn watch_follows_the_active_key() {
        let settings = settings(Provider::LlamaCpp, Some("a"));
        let mut lifecycle = ModelLifecycle::new(MockFactory::echo(), settings.clone());
        let rx = lifecycle.watch_active();
        assert_eq!(*rx.borrow(), None);

        lifecycle.session().unwrap();
        assert_eq!(*rx.borrow(), Some(key(Provider::LlamaCpp, "a")));

        lifecycle.unload_active();
        assert_eq!(*rx.borrow(), None);
    }

    #[test]
    fn standard_factory_resolves_providers() {
        let registry = ModelRegistry::new(vec![ModelInformation {
            file_name: "m.gguf".into(),
            ..ModelInformation::named("local", Provider::LlamaCpp)
        }]);
        let factory = StandardSessionFactory::new(registry, "models", OllamaOptions::default());

        let local = factory.create(&key(Provider::LlamaCpp, "local")).unwrap();
        assert!(matches!(local, BackendSession::Local(_)));
        assert!(!local.is_loaded());

        assert!(matches!(
            factory.create(&key(Provider::LlamaCpp, "other")),
            Err(ModelError::UnknownModel { .. })
        ));

        let remote = factory.create(&key(Provider::Ollama, "llama3")).unwrap();
        assert!(matches!(remote, BackendSession::Remote(_)));
        assert_eq!(remote.model_info().name, "llama3");
        assert_eq!(remote.model_info().provider, Provider::Ollama);
    }
}
