//! Shell-out provider for the Claude CLI.
//!
//! Invokes `claude -p` headless with the prompt on stdin. Model aliases
//! map to the CLI's `--model` flag; Claude takes no reasoning-effort
//! suffix.

use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use tokio_util::sync::CancellationToken;

use super::{Capabilities, ModelSpec, Provider, ProviderOutcome, ProviderRequest};
use crate::errors::{ProcessError, ProviderError};
use crate::process::{ProcessRunner, RunOptions};

const MODELS: &[&str] = &["opus", "sonnet", "haiku"];

#[derive(Debug, Clone)]
pub struct ClaudeProvider {
    command: String,
    runner: ProcessRunner,
}

impl Default for ClaudeProvider {
    fn default() -> Self {
        Self::new("claude")
    }
}

impl ClaudeProvider {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            runner: ProcessRunner,
        }
    }

    fn args(&self, model: Option<&ModelSpec>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
        ];
        if let Some(spec) = model {
            args.push("--model".to_string());
            args.push(spec.model.clone());
        }
        args
    }
}

#[async_trait]
impl Provider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            models: MODELS,
            effort_suffixes: false,
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

/// Shared by the shell-out providers.
pub(super) fn map_process_error(
    provider: &str,
    program: &str,
    err: ProcessError,
) -> ProviderError {
    match err {
        ProcessError::SpawnFailed { source, .. } if source.kind() == IoErrorKind::NotFound => {
            ProviderError::Missing {
                program: program.to_string(),
            }
        }
        ProcessError::TimedOut { elapsed, .. } => ProviderError::Timeout {
            provider: provider.to_string(),
            elapsed,
        },
        ProcessError::Killed { .. } => ProviderError::Interrupted,
        other => ProviderError::Other(other.into()),
    }
}
