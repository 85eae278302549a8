//! Provider registry.
//!
//! Holds the instantiated model providers and resolves `provider/model`
//! specs. Providers are constructed by the embedder (HTTP adapters are out
//! of scope for the core) and registered at startup.

use std::collections::HashMap;
use std::sync::Arc;

use casc_domain::error::{Error, Result};

use crate::traits::ModelProvider;

/// Mask substrings that look like API keys or bearer tokens in an error
/// message, so raw secrets never reach logs or telemetry rows.
pub fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= 20
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            let masked = format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..]);
            result = result.replace(trimmed, &masked);
        }
    }
    result
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProviderRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registered providers plus the process default model spec.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    default_model: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        let id = provider.provider_id().to_string();
        tracing::info!(provider_id = %id, "registered model provider");
        self.providers.insert(id, provider);
    }

    /// Model spec used when neither the cell nor the cascade names one.
    pub fn set_default_model(&mut self, model_spec: impl Into<String>) {
        self.default_model = Some(model_spec.into());
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(provider_id).cloned()
    }

    /// Resolve a model spec to `(provider, model)`.
    ///
    /// A spec is `provider_id/model_name`; the model string passed to the
    /// provider keeps the full spec so adapters can split as they prefer.
    /// `None` falls back to the registry default; with no default and
    /// exactly one registered provider, that provider is used with its own
    /// default model.
    pub fn resolve(&self, model_spec: Option<&str>) -> Result<(Arc<dyn ModelProvider>, String)> {
        let spec = match model_spec.or(self.default_model.as_deref()) {
            Some(spec) => spec.to_string(),
            None => {
                if self.providers.len() == 1 {
                    let provider = self.providers.values().next().cloned().ok_or_else(|| {
                        Error::Config("no model providers registered".into())
                    })?;
                    let id = provider.provider_id().to_string();
                    return Ok((provider, id));
                }
                return Err(Error::Config(
                    "no model spec given and no default model configured".into(),
                ));
            }
        };

        let provider_id = spec.split('/').next().unwrap_or(&spec);
        let provider = self.providers.get(provider_id).cloned().ok_or_else(|| {
            Error::Config(format!("no provider registered for model spec {spec}"))
        })?;
        Ok((provider, spec))
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedProvider;

    #[test]
    fn resolves_provider_from_spec_prefix() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider::new("mock")));

        let (provider, model) = registry.resolve(Some("mock/fast-1")).unwrap();
        assert_eq!(provider.provider_id(), "mock");
        assert_eq!(model, "mock/fast-1");

        assert!(registry.resolve(Some("missing/model")).is_err());
    }

    #[test]
    fn default_model_fallback() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider::new("mock")));
        registry.register(Arc::new(ScriptedProvider::new("other")));

        assert!(registry.resolve(None).is_err());
        registry.set_default_model("other/base");
        let (provider, model) = registry.resolve(None).unwrap();
        assert_eq!(provider.provider_id(), "other");
        assert_eq!(model, "other/base");
    }

    #[test]
    fn single_provider_needs_no_default() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider::new("solo")));
        let (provider, model) = registry.resolve(None).unwrap();
        assert_eq!(provider.provider_id(), "solo");
        assert_eq!(model, "solo");
    }

    #[test]
    fn masks_long_tokens() {
        let masked = mask_secrets("auth failed for key sk-abcdefghijklmnopqrstuvwxyz123456");
        assert!(!masked.contains("abcdefghijklmnopqrstuvwxyz"));
        assert!(masked.contains("..."));
        // Short words survive untouched.
        assert_eq!(mask_secrets("plain failure"), "plain failure");
    }
}
