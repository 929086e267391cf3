//! Queue-driven termination.
//!
//! The stage keeps iterating while an external queue (a task tracker
//! queried via CLI) still has work for the session. An empty queue stops
//! the stage.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Command;

use super::{PolicyContext, TerminationDecision, TerminationPolicy};
use crate::template::{TemplateVars, resolve};

/// The queue probe interface.
pub trait QueueSource: Send {
    /// Whether anything is still pending for this session.
    fn has(&self, session: &str) -> Result<bool>;
}

/// Shell-command queue probe: pending iff the command exits zero and
/// prints anything non-blank. `{{SESSION}}` in the command resolves to the
/// session name.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    command: String,
}

impl CommandQueue {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl QueueSource for CommandQueue {
    fn has(&self, session: &str) -> Result<bool> {
        let mut vars = TemplateVars::new();
        vars.set("SESSION", session);
        let command = resolve(&self.command, &vars);

        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .with_context(|| format!("failed to run queue command: {}", command))?;
        if !output.status.success() {
            anyhow::bail!(
                "queue command exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }
}

/// Stop when the queue is empty.
pub struct QueuePolicy<S: QueueSource> {
    source: S,
}

impl<S: QueueSource> QueuePolicy<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<S: QueueSource> TerminationPolicy for QueuePolicy<S> {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn decide(&mut self, cx: &PolicyContext<'_>) -> Result<TerminationDecision> {
        if self.source.has(cx.session)? {
            Ok(TerminationDecision::Continue)
        } else {
            Ok(TerminationDecision::stop("queue empty"))
        }
    }
}
