//! Atomic session state snapshot.
//!
//! `state.json` is the fast-read summary of a session: status, current
//! iteration, history entries for the termination policies, and how many
//! events it already reflects. It is advisory; the event log remains the
//! source of truth for reconstruction. Every write goes to a temp file in
//! the same directory and is renamed over the target.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::ErrorKind;
use crate::report::{AgentReport, Decision};

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    /// Statuses this one may transition to.
    pub fn allowed(self) -> &'static [SessionStatus] {
        match self {
            SessionStatus::Pending => &[SessionStatus::Running],
            SessionStatus::Running => &[
                SessionStatus::Completed,
                SessionStatus::Failed,
                SessionStatus::Paused,
            ],
            SessionStatus::Paused => &[SessionStatus::Running, SessionStatus::Aborted],
            SessionStatus::Failed => &[SessionStatus::Running],
            SessionStatus::Completed | SessionStatus::Aborted => &[],
        }
    }

    pub fn can_transition(self, to: SessionStatus) -> bool {
        self.allowed().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One completed iteration, as the termination policies see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_completed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_touched: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plateau: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

impl IterationRecord {
    pub fn from_report(iteration: u32, report: &AgentReport) -> Self {
        Self {
            iteration,
            decision: report.decision,
            summary: report.summary.clone(),
            items_completed: report.work.as_ref().and_then(|w| w.items_completed),
            files_touched: report
                .work
                .as_ref()
                .and_then(|w| w.files_touched.as_ref())
                .map(|f| f.len() as u32),
            plateau: report.plateau,
            timestamp: Utc::now(),
        }
    }
}

/// The snapshot persisted as `state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session: String,
    /// "loop" or "pipeline".
    pub kind: String,
    pub pipeline: String,
    pub status: SessionStatus,
    /// Iteration currently in flight (1-based), 0 before the first.
    pub iteration: u32,
    /// Last iteration that completed within the current stage instance.
    pub iteration_completed: u32,
    /// Set while an iteration is in flight; cleared on completion.
    pub iteration_started: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(default)]
    pub completed_stages: Vec<String>,
    #[serde(default)]
    pub history: Vec<IterationRecord>,
    /// How many events from `events.jsonl` this snapshot reflects.
    #[serde(default)]
    pub events_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,
}

impl SessionState {
    pub fn new(session: impl Into<String>, kind: impl Into<String>, pipeline: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session: session.into(),
            kind: kind.into(),
            pipeline: pipeline.into(),
            status: SessionStatus::Running,
            iteration: 0,
            iteration_completed: 0,
            iteration_started: None,
            started_at: now,
            updated_at: now,
            current_stage: None,
            completed_stages: Vec::new(),
            history: Vec::new(),
            events_processed: 0,
            error: None,
            error_type: None,
        }
    }

    /// First iteration a resumed run should execute.
    pub fn resume_from(&self) -> u32 {
        self.iteration_completed + 1
    }

    /// An iteration was started but never completed: the marker of a crash
    /// mid-iteration.
    pub fn has_incomplete_iteration(&self) -> bool {
        self.iteration_started.is_some() && self.iteration_completed < self.iteration
    }

    /// Reset per-stage progress when a new stage instance begins.
    pub fn enter_stage(&mut self, stage: &str) {
        self.current_stage = Some(stage.to_string());
        self.iteration = 0;
        self.iteration_completed = 0;
        self.iteration_started = None;
        self.history.clear();
    }
}

/// Reader/writer for `state.json` with validated transitions.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the snapshot if absent, otherwise return the existing one.
    pub fn init(&self, session: &str, kind: &str, pipeline: &str) -> Result<SessionState> {
        if self.path.exists() {
            return self.load();
        }
        let state = SessionState::new(session, kind, pipeline);
        self.write(&state)?;
        Ok(state)
    }

    pub fn load(&self) -> Result<SessionState> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state file {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("state file {} is corrupt", self.path.display()))
    }

    /// Atomic write: temp file in the same directory, then rename.
    pub fn write(&self, state: &SessionState) -> Result<()> {
        let parent = self
            .path
            .parent()
            .context("state path has no parent directory")?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let content =
            serde_json::to_string_pretty(state).context("failed to serialize session state")?;
        let tmp = parent.join(format!(
            ".state-{}.tmp",
            std::process::id()
        ));
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename state into {}", self.path.display()))?;
        Ok(())
    }

    /// Read-modify-write.
    pub fn update(&self, mutate: impl FnOnce(&mut SessionState)) -> Result<SessionState> {
        let mut state = self.load()?;
        mutate(&mut state);
        state.updated_at = Utc::now();
        self.write(&state)?;
        Ok(state)
    }

    /// Validated status transition.
    pub fn transition(&self, to: SessionStatus) -> Result<SessionState> {
        let state = self.load()?;
        if !state.status.can_transition(to) {
            bail!("invalid transition {} -> {}", state.status, to);
        }
        self.update(|s| s.status = to)
    }

    pub fn mark_iteration_started(&self, iteration: u32) -> Result<SessionState> {
        self.update(|s| {
            if s.status == SessionStatus::Pending {
                s.status = SessionStatus::Running;
            }
            s.iteration = iteration;
            s.iteration_started = Some(Utc::now());
        })
    }

    pub fn mark_iteration_completed(&self, iteration: u32) -> Result<SessionState> {
        self.update(|s| {
            s.iteration_completed = iteration;
            s.iteration_started = None;
        })
    }

    pub fn mark_completed(&self) -> Result<SessionState> {
        self.transition(SessionStatus::Completed)
    }

    pub fn mark_failed(&self, kind: ErrorKind, message: &str) -> Result<SessionState> {
        let state = self.load()?;
        if !state.status.can_transition(SessionStatus::Failed) {
            bail!("invalid transition {} -> failed", state.status);
        }
        self.update(|s| {
            s.status = SessionStatus::Failed;
            s.error = Some(message.to_string());
            s.error_type = Some(kind);
        })
    }

    pub fn mark_paused(&self) -> Result<SessionState> {
        self.transition(SessionStatus::Paused)
    }

    pub fn mark_resumed(&self) -> Result<SessionState> {
        let state = self.load()?;
        if !state.status.can_transition(SessionStatus::Running) {
            bail!("invalid transition {} -> running", state.status);
        }
        self.update(|s| {
            s.status = SessionStatus::Running;
            s.error = None;
            s.error_type = None;
        })
    }

    pub fn record_iteration(&self, record: IterationRecord) -> Result<SessionState> {
        self.update(|s| s.history.push(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> StateStore {
        StateStore::new(dir.join("state.json"))
    }

    #[test]
    fn init_creates_running_snapshot_once() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let state = store.init("alpha", "pipeline", "refactor").unwrap();
        assert_eq!(state.status, SessionStatus::Running);
        assert_eq!(state.iteration_completed, 0);

        // Second init loads rather than resets.
        store.mark_iteration_started(1).unwrap();
        let again = store.init("alpha", "pipeline", "refactor").unwrap();
        assert_eq!(again.iteration, 1);
    }

    #[test]
    fn write_then_load_round_trips_every_field() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = SessionState::new("alpha", "pipeline", "refactor");
        state.iteration = 3;
        state.iteration_completed = 2;
        state.iteration_started = Some(Utc::now());
        state.current_stage = Some("stage-00-plan".into());
        state.completed_stages = vec!["stage-00-plan".into()];
        state.history.push(IterationRecord {
            iteration: 1,
            decision: Decision::Continue,
            summary: Some("did things".into()),
            items_completed: Some(2),
            files_touched: Some(3),
            plateau: None,
            timestamp: Utc::now(),
        });
        state.events_processed = 9;
        state.error = Some("boom".into());
        state.error_type = Some(ErrorKind::ProviderCrashed);

        store.write(&state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn transition_table_is_enforced() {
        use SessionStatus::*;
        let cases: &[(SessionStatus, SessionStatus, bool)] = &[
            (Pending, Running, true),
            (Pending, Completed, false),
            (Running, Completed, true),
            (Running, Failed, true),
            (Running, Paused, true),
            (Running, Aborted, false),
            (Paused, Running, true),
            (Paused, Aborted, true),
            (Paused, Completed, false),
            (Failed, Running, true),
            (Failed, Completed, false),
            (Completed, Running, false),
            (Aborted, Running, false),
        ];
        for &(from, to, ok) in cases {
            assert_eq!(from.can_transition(to), ok, "{} -> {}", from, to);
        }
    }

    #[test]
    fn invalid_transition_fails_with_message() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init("alpha", "loop", "fix").unwrap();
        store.mark_completed().unwrap();
        let err = store.transition(SessionStatus::Running).unwrap_err();
        assert!(err.to_string().contains("invalid transition"));
    }

    #[test]
    fn iteration_marks_track_in_flight_work() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init("alpha", "loop", "fix").unwrap();

        let state = store.mark_iteration_started(1).unwrap();
        assert!(state.has_incomplete_iteration());
        assert_eq!(state.resume_from(), 1);

        let state = store.mark_iteration_completed(1).unwrap();
        assert!(!state.has_incomplete_iteration());
        assert!(state.iteration_started.is_none());
        assert_eq!(state.resume_from(), 2);
    }

    #[test]
    fn failed_session_can_resume() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init("alpha", "loop", "fix").unwrap();
        store.mark_failed(ErrorKind::ProviderTimeout, "timed out").unwrap();

        let state = store.mark_resumed().unwrap();
        assert_eq!(state.status, SessionStatus::Running);
        assert!(state.error.is_none());
        assert!(state.error_type.is_none());
    }

    #[test]
    fn enter_stage_resets_iteration_progress() {
        let mut state = SessionState::new("alpha", "pipeline", "refactor");
        state.iteration = 4;
        state.iteration_completed = 4;
        state.history.push(IterationRecord {
            iteration: 4,
            decision: Decision::Stop,
            summary: None,
            items_completed: None,
            files_touched: None,
            plateau: None,
            timestamp: Utc::now(),
        });

        state.enter_stage("stage-01-implement");
        assert_eq!(state.iteration, 0);
        assert_eq!(state.iteration_completed, 0);
        assert!(state.history.is_empty());
        assert_eq!(state.current_stage.as_deref(), Some("stage-01-implement"));
    }
}
