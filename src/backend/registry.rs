use std::{collections::HashMap, sync::Arc};

use tracing::{debug, info};

use crate::backend::{fake::FakeChatModel, openai::OpenAiChatModel, BackendError, ChatModel};
use crate::models::ModelConfig;

pub type ModelConstructor = Arc<
    dyn Fn(Option<String>, ModelConfig) -> Result<Arc<dyn ChatModel>, BackendError> + Send + Sync,
>;

/// Engine name to constructor table.
///
/// Built and filled once at startup, then shared read-only. Registering a
/// name twice is an error rather than a silent override.
#[derive(Default, Clone)]
pub struct ModelRegistry {
    constructors: HashMap<String, ModelConstructor>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every engine compiled into this build.
    pub fn with_default_engines() -> Result<Self, BackendError> {
        let mut registry = Self::new();
        registry.register(super::fake::ENGINE, |model, config| {
            Ok(Arc::new(FakeChatModel::new(model, config)?) as Arc<dyn ChatModel>)
        })?;
        registry.register(super::openai::ENGINE, |model, config| {
            Ok(Arc::new(OpenAiChatModel::new(model, config)?) as Arc<dyn ChatModel>)
        })?;
        #[cfg(feature = "llama")]
        registry.register(super::local::ENGINE, |model, config| {
            let handle = super::local::LocalTransformerModel::load_with(
                model,
                config,
                super::llama::LlamaRuntime::load,
            )?;
            Ok(Arc::new(handle) as Arc<dyn ChatModel>)
        })?;
        Ok(registry)
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> Result<(), BackendError>
    where
        F: Fn(Option<String>, ModelConfig) -> Result<Arc<dyn ChatModel>, BackendError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(BackendError::DuplicateEngine(name));
        }
        debug!(engine = %name, "engine registered");
        self.constructors.insert(name, Arc::new(constructor));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn engines(&self) -> Vec<&str> {
        let mut names = self
            .constructors
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    /// Builds a handle for `name`. `model` falls back to the engine default
    /// and a missing `config` to an empty one.
    pub fn create(
        &self,
        name: &str,
        model: Option<String>,
        config: Option<ModelConfig>,
    ) -> Result<Arc<dyn ChatModel>, BackendError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| BackendError::UnknownEngine(name.to_owned()))?;

        let handle = constructor(model, config.unwrap_or_default())?;
        info!(engine = %handle.engine(), model = %handle.model(), "model handle created");
        Ok(handle)
    }
}
