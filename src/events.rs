//! Append-only JSONL event log.
//!
//! The log is the durable spine of a session: one JSON object per line,
//! appended under an exclusive advisory lock so concurrent writers (the
//! driver thread and parallel workers) never interleave partial lines.
//! Readers skip malformed lines with a warning; a truncated trailing line
//! (a crash mid-append) is skipped without error.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Where in the plan an event happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub node_path: String,
    pub node_run: u32,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl Cursor {
    pub fn new(node_path: impl Into<String>, node_run: u32, iteration: u32) -> Self {
        Self {
            node_path: node_path.into(),
            node_run,
            iteration,
            provider: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// Lifecycle transitions recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    SessionComplete,
    SessionPaused,
    SessionResumed,
    NodeStart,
    NodeComplete,
    IterationStart,
    IterationComplete,
    ParallelProviderStart,
    ParallelProviderComplete,
    JudgeStart,
    JudgeComplete,
    Error,
    WorkerComplete,
}

/// One event record. Serialized as a single JSONL line:
/// `{ts, type, session, cursor|null, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub session: String,
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventType, session: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            kind,
            session: session.into(),
            cursor: None,
            data: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Append-only reader/writer for a session's `events.jsonl`.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single line. The advisory lock covers the
    /// write so a line is never interleaved with another appender's.
    pub fn append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_string(event).context("failed to serialize event")?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open event log {}", self.path.display()))?;

        FileExt::lock_exclusive(&file).context("failed to lock event log")?;
        let write_result = file
            .write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .context("failed to append event");
        let _ = FileExt::unlock(&file);
        write_result
    }

    /// All valid events, in append order. Malformed lines are skipped with
    /// a warning; an unterminated trailing line is skipped silently.
    pub fn read(&self) -> Result<Vec<Event>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read event log {}", self.path.display()))?;

        let truncated_tail = !content.is_empty() && !content.ends_with('\n');
        let lines: Vec<&str> = content.lines().collect();
        let complete = if truncated_tail {
            lines.len().saturating_sub(1)
        } else {
            lines.len()
        };

        let mut events = Vec::with_capacity(complete);
        for (idx, line) in lines.iter().take(complete).enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(
                        line = idx + 1,
                        path = %self.path.display(),
                        error = %e,
                        "skipping malformed event line"
                    );
                }
            }
        }
        Ok(events)
    }

    /// Events with index >= offset.
    pub fn tail(&self, offset: usize) -> Result<Vec<Event>> {
        let mut events = self.read()?;
        if offset >= events.len() {
            return Ok(Vec::new());
        }
        Ok(events.split_off(offset))
    }

    /// Number of valid events.
    pub fn count(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }
}
