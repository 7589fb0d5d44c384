use std::collections::HashMap;
use std::sync::Arc;

use promptloop_common::config::LlmConfig;

use crate::llm::{build_provider, Provider};

/// Name → provider lookup used by callers to pick a backend at runtime.
///
/// Names are trimmed and lowercased on both `register` and `get`.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured provider, sharing one HTTP client.
    pub fn from_config(config: &LlmConfig) -> Self {
        let http = reqwest::Client::new();
        let mut registry = Self::new();

        for provider_config in &config.providers {
            registry.register(build_provider(provider_config, http.clone()));
        }

        registry.default_provider = config
            .default_provider
            .as_deref()
            .map(normalize)
            .filter(|name| !name.is_empty());

        tracing::info!(
            providers = registry.providers.len(),
            default = registry.default_provider.as_deref().unwrap_or("-"),
            "Provider registry built"
        );

        registry
    }

    /// Register a provider under its name. A blank name is a no-op.
    ///
    /// Re-registering a name replaces the earlier provider. Returns whether
    /// the provider was stored.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> bool {
        let key = normalize(provider.name());
        if key.is_empty() {
            tracing::warn!("Ignoring provider with empty name");
            return false;
        }

        if self.providers.insert(key.clone(), provider).is_some() {
            tracing::debug!(provider = %key, "Replaced registered provider");
        }
        true
    }

    /// Look up a provider. Unregistered and blank names yield `None`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        let key = normalize(name);
        if key.is_empty() {
            return None;
        }
        self.providers.get(&key).cloned()
    }

    /// The configured default provider, if it is registered.
    pub fn default_provider(&self) -> Option<Arc<dyn Provider>> {
        self.default_provider
            .as_deref()
            .and_then(|name| self.get(name))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{BoxFuture, CallContext, LlmError, Request, Response};
    use promptloop_common::config::{ProviderConfig, ProviderKind};

    struct NamedProvider(&'static str);

    impl Provider for NamedProvider {
        fn name(&self) -> &str {
            self.0
        }

        fn complete<'a>(
            &'a self,
            _ctx: &'a CallContext,
            _request: &'a Request,
        ) -> BoxFuture<'a, Result<Response, LlmError>> {
            Box::pin(async { Err(LlmError::Http("not wired".into())) })
        }
    }

    #[test]
    fn test_register_and_get_case_insensitive() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.register(Arc::new(NamedProvider("  Anthropic "))));

        assert!(registry.get("anthropic").is_some());
        assert!(registry.get("ANTHROPIC").is_some());
        assert!(registry.get(" anthropic ").is_some());
        assert_eq!(registry.names(), vec!["anthropic"]);
    }

    #[test]
    fn test_blank_name_is_noop() {
        let mut registry = ProviderRegistry::new();
        assert!(!registry.register(Arc::new(NamedProvider("   "))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_unknown_or_blank_is_none() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(NamedProvider("openai")));

        assert!(registry.get("gemini").is_none());
        assert!(registry.get("").is_none());
        assert!(registry.get("   ").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_from_config_registers_all() {
        let mut claude = ProviderConfig::new(ProviderKind::Anthropic);
        claude.name = Some("Claude".into());
        let config = LlmConfig {
            default_provider: Some("CLAUDE".into()),
            providers: vec![claude, ProviderConfig::new(ProviderKind::OpenAi)],
        };

        let registry = ProviderRegistry::from_config(&config);
        assert_eq!(registry.names(), vec!["claude", "openai"]);
        assert_eq!(registry.default_provider().unwrap().name(), "claude");
        assert!(registry.get("openai").unwrap().as_multi_turn().is_some());
    }
}
