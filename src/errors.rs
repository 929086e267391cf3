//! Typed error hierarchy for the conductor engine.
//!
//! Four enums cover the subsystems that need matchable errors:
//! - `ErrorKind` — the wire-level error classification recorded in state
//!   snapshots and `error.json`
//! - `ProcessError` — subprocess execution failures
//! - `ProviderError` — agent provider failures
//! - `LockError` — session lock acquisition failures

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Classification of a failure, persisted in state snapshots and error
/// events so tooling can decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProviderTimeout,
    ProviderCrashed,
    ProviderMissing,
    ResultInvalid,
    ResultMissing,
    LockContention,
    StateCorrupt,
    SignalInterrupt,
    IterationTimeout,
    JudgeFailed,
}

impl ErrorKind {
    /// How many times an iteration may be retried at the same index before
    /// the error is promoted to fatal.
    pub fn max_retries(self) -> u32 {
        match self {
            ErrorKind::ProviderTimeout | ErrorKind::IterationTimeout => 2,
            ErrorKind::ProviderCrashed | ErrorKind::ResultMissing => 1,
            ErrorKind::JudgeFailed => 1,
            ErrorKind::ProviderMissing
            | ErrorKind::ResultInvalid
            | ErrorKind::LockContention
            | ErrorKind::StateCorrupt
            | ErrorKind::SignalInterrupt => 0,
        }
    }

    pub fn is_retryable(self) -> bool {
        self.max_retries() > 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ProviderTimeout => "provider_timeout",
            ErrorKind::ProviderCrashed => "provider_crashed",
            ErrorKind::ProviderMissing => "provider_missing",
            ErrorKind::ResultInvalid => "result_invalid",
            ErrorKind::ResultMissing => "result_missing",
            ErrorKind::LockContention => "lock_contention",
            ErrorKind::StateCorrupt => "state_corrupt",
            ErrorKind::SignalInterrupt => "signal_interrupt",
            ErrorKind::IterationTimeout => "iteration_timeout",
            ErrorKind::JudgeFailed => "judge_failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors from subprocess execution.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("refusing to start: {remaining}s remain but at least {required}s are required")]
    InsufficientTime { remaining: u64, required: u64 },

    #[error("process timed out after {:.1}s", elapsed.as_secs_f64())]
    TimedOut { elapsed: Duration, graceful: bool },

    #[error("process was killed before exiting voluntarily")]
    Killed { graceful: bool },

    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from agent provider execution.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider '{name}' is not registered (available: {})", available.join(", "))]
    Unknown { name: String, available: Vec<String> },

    #[error("provider '{name}' duplicates an existing registration")]
    Duplicate { name: String },

    #[error("provider binary '{program}' not found; install it or adjust the command in conductor.toml")]
    Missing { program: String },

    #[error("model '{model}' is not supported by provider '{provider}' (supported: {})", supported.join(", "))]
    UnsupportedModel {
        provider: String,
        model: String,
        supported: Vec<String>,
    },

    #[error("provider '{provider}' timed out after {:.0}s", elapsed.as_secs_f64())]
    Timeout { provider: String, elapsed: Duration },

    #[error("provider '{provider}' exited with code {exit_code}")]
    Crashed {
        provider: String,
        exit_code: i32,
        stderr_tail: String,
    },

    #[error("provider execution was interrupted")]
    Interrupted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    /// Map to the wire-level classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Unknown { .. }
            | ProviderError::Duplicate { .. }
            | ProviderError::Missing { .. }
            | ProviderError::UnsupportedModel { .. } => ErrorKind::ProviderMissing,
            ProviderError::Timeout { .. } => ErrorKind::ProviderTimeout,
            ProviderError::Crashed { .. } => ErrorKind::ProviderCrashed,
            ProviderError::Interrupted => ErrorKind::SignalInterrupt,
            ProviderError::Other(_) => ErrorKind::ProviderCrashed,
        }
    }
}

/// Errors from session lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "session '{session}' is locked by live pid {pid}; stop that run or pass --force to take over"
    )]
    Held { session: String, pid: u32 },

    #[error("lock file {path} is unreadable: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
