//! Name-indexed provider registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ClaudeProvider, CodexProvider, Provider};
use crate::errors::ProviderError;

/// Maps canonical lowercase names to executors. Each engine owns its own
/// registry; there is no process-global one.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in shell-out providers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        // Builtin names cannot collide in a fresh registry.
        let _ = registry.register(Arc::new(ClaudeProvider::default()));
        let _ = registry.register(Arc::new(CodexProvider::default()));
        registry
    }

    /// Register under the provider's normalized name; duplicates fail.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<(), ProviderError> {
        let name = normalize(provider.name());
        if self.providers.contains_key(&name) {
            return Err(ProviderError::Duplicate { name });
        }
        self.providers.insert(name, provider);
        Ok(())
    }

    /// Resolve by name; the error lists what is available.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        let key = normalize(name);
        self.providers
            .get(&key)
            .cloned()
            .ok_or_else(|| ProviderError::Unknown {
                name: name.to_string(),
                available: self.names(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(&normalize(name))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}
