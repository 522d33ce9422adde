pub mod echo;

use std::sync::Arc;

use {tether_config::TetherConfig, tracing::info};

use crate::model::LlmProvider;

pub use echo::EchoProvider;

/// Available LLM providers, looked up by model id on each chat request.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn LlmProvider>>,
    default_id: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers enabled in `config`.
    pub fn from_config(config: &TetherConfig) -> Self {
        let mut reg = Self::new();
        if config.providers.is_enabled("echo") {
            let model = config
                .providers
                .get("echo")
                .and_then(|e| e.model.clone())
                .unwrap_or_else(|| "echo".into());
            reg.register(Arc::new(EchoProvider::new(model)));
        }
        reg.default_id = config.chat.default_model.clone();
        info!(providers = ?reg.ids(), default = ?reg.default_id, "provider registry ready");
        reg
    }

    /// Add a provider, replacing any previous one with the same id.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.retain(|p| p.id() != provider.id());
        self.providers.push(provider);
    }

    pub fn set_default(&mut self, id: impl Into<String>) {
        self.default_id = Some(id.into());
    }

    /// The configured default model id, registered or not.
    pub fn default_id(&self) -> Option<&str> {
        self.default_id.as_deref()
    }

    /// Look up by model id, falling back to provider name.
    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .iter()
            .find(|p| p.id() == id)
            .or_else(|| self.providers.iter().find(|p| p.name() == id))
            .cloned()
    }

    /// The provider for a request: the requested id, else the configured
    /// default, else the first registered provider.
    pub fn resolve(&self, requested: Option<&str>) -> Option<Arc<dyn LlmProvider>> {
        match requested.or(self.default_id.as_deref()) {
            Some(id) => self.get(id),
            None => self.providers.first().cloned(),
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.id()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
