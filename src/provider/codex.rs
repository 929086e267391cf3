//! Shell-out provider for the Codex CLI.
//!
//! Invokes `codex exec` non-interactively with the prompt on stdin. Model
//! aliases accept a reasoning-effort suffix (`gpt-5:high`), forwarded via
//! `-c model_reasoning_effort=...`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::claude::map_process_error;
use super::{Capabilities, ModelSpec, Provider, ProviderOutcome, ProviderRequest};
use crate::errors::ProviderError;
use crate::process::{ProcessRunner, RunOptions};

const MODELS: &[&str] = &["gpt-5", "gpt-5-codex"];

#[derive(Debug, Clone)]
pub struct CodexProvider {
    command: String,
    runner: ProcessRunner,
}

impl Default for CodexProvider {
    fn default() -> Self {
        Self::new("codex")
    }
}

impl CodexProvider {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            runner: ProcessRunner,
        }
    }

    fn args(&self, model: Option<&ModelSpec>) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "--sandbox".to_string(),
            "workspace-write".to_string(),
            "--skip-git-repo-check".to_string(),
        ];
        if let Some(spec) = model {
            args.push("--model".to_string());
            args.push(spec.model.clone());
            if let Some(effort) = &spec.effort {
                args.push("-c".to_string());
                args.push(format!("model_reasoning_effort={}", effort));
            }
        }
        args.push("-".to_string());
        args
    }
}

#[async_trait]
impl Provider for CodexProvider {
    fn name(&self) -> &str {
        "codex"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            models: MODELS,
            effort_suffixes: true,
        }
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: ProviderRequest,
    ) -> Result<ProviderOutcome, ProviderError> {
        let spec = request
            .model
            .as_deref()
            .map(|m| ModelSpec::parse(self.name(), &self.capabilities(), m))
            .transpose()?;

        let opts = RunOptions {
            timeout: Some(request.timeout),
            deadline: request.deadline,
            work_dir: Some(request.work_dir.clone()),
            env: request.env.clone(),
            stdin: Some(request.prompt.clone()),
            ..RunOptions::default()
        };

        let outcome = self
            .runner
            .run(cancel, &self.command, &self.args(spec.as_ref()), opts)
            .await
            .map_err(|e| map_process_error(self.name(), &self.command, e))?;

        Ok(ProviderOutcome {
            output: outcome.stdout,
            exit_code: outcome.exit_code,
            duration: outcome.duration,
            truncated: outcome.truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_models_with_effort() {
        let provider = CodexProvider::default();
        let mut request = ProviderRequest::new("prompt", "/tmp");

        request.model = Some("gpt-5-codex:medium".into());
        assert!(provider.validate(&request).is_ok());

        request.model = Some("gpt-5:extreme".into());
        assert!(provider.validate(&request).is_err());

        request.model = Some("sonnet".into());
        assert!(provider.validate(&request).is_err());
    }

    #[test]
    fn effort_suffix_becomes_config_flag() {
        let provider = CodexProvider::default();
        let spec = ModelSpec {
            model: "gpt-5".into(),
            effort: Some("high".into()),
        };
        let args = provider.args(Some(&spec));
        assert!(args.contains(&"model_reasoning_effort=high".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }
}
