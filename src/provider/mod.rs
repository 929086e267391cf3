//! Agent provider abstraction.
//!
//! A provider turns a rendered prompt into an external agent invocation.
//! It is the single polymorphism boundary for agent backends: the engine
//! resolves providers by name through the registry and never assumes a
//! concrete backend. Providers write nothing outside the work directory
//! they are handed.

mod claude;
mod codex;
mod registry;

pub use claude::ClaudeProvider;
pub use codex::CodexProvider;
pub use registry::ProviderRegistry;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::ProviderError;

/// Default per-invocation timeout.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(900);

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Fully rendered prompt text.
    pub prompt: String,
    /// Model alias, optionally with a reasoning-effort suffix (`name:effort`).
    pub model: Option<String>,
    /// The only directory tree the agent may write.
    pub work_dir: PathBuf,
    /// Extra environment for the child (e.g. CONDUCTOR_CONTEXT).
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Absolute session deadline, if a runtime limit is configured.
    pub deadline: Option<std::time::Instant>,
}

impl ProviderRequest {
    pub fn new(prompt: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            work_dir: work_dir.into(),
            env: Vec::new(),
            timeout: DEFAULT_PROVIDER_TIMEOUT,
            deadline: None,
        }
    }
}

/// What an invocation produced.
#[derive(Debug, Clone)]
pub struct ProviderOutcome {
    pub output: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub truncated: bool,
}

impl ProviderOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// What a provider supports, used for fail-fast model validation.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub models: &'static [&'static str],
    /// Whether `model:effort` suffixes are accepted.
    pub effort_suffixes: bool,
}

/// A parsed `model[:effort]` spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub model: String,
    pub effort: Option<String>,
}

const EFFORT_LEVELS: &[&str] = &["low", "medium", "high"];

impl ModelSpec {
    /// Parse and validate a model string against a provider's capabilities.
    pub fn parse(
        provider: &str,
        caps: &Capabilities,
        raw: &str,
    ) -> Result<ModelSpec, ProviderError> {
        let (model, effort) = match raw.split_once(':') {
            Some((m, e)) => (m, Some(e)),
            None => (raw, None),
        };

        let unsupported = || ProviderError::UnsupportedModel {
            provider: provider.to_string(),
            model: raw.to_string(),
            supported: caps.models.iter().map(|s| s.to_string()).collect(),
        };

        if !caps.models.contains(&model) {
            return Err(unsupported());
        }
        if let Some(effort) = effort {
            if !caps.effort_suffixes || !EFFORT_LEVELS.contains(&effort) {
                return Err(unsupported());
            }
        }
        Ok(ModelSpec {
            model: model.to_string(),
            effort: effort.map(str::to_string),
        })
    }
}

/// The agent-invocation interface.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Canonical lowercase name.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Fail-fast request validation; called before any subprocess spawns.
    fn validate(&self, request: &ProviderRequest) -> Result<(), ProviderError> {
        if let Some(model) = &request.model {
            ModelSpec::parse(self.name(), &self.capabilities(), model)?;
        }
        Ok(())
    }

    /// One-time setup before a session's first invocation.
    async fn init(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Run the agent. Non-zero exits are returned in the outcome, not as
    /// errors; timeouts and interruptions are errors.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: ProviderRequest,
    ) -> Result<ProviderOutcome, ProviderError>;

    /// Teardown after the session finishes with this provider.
    async fn shutdown(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
