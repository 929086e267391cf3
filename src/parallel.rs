//! Parallel provider fan-out.
//!
//! A parallel node runs its inner stage sequence once per provider, each
//! against an isolated directory scope under `providers/<p>/`. Workers run
//! concurrently and share nothing but the session event log; the merge
//! manifest is written only when every worker succeeds, and downstream
//! `from_parallel` inputs read that manifest alone.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;

use crate::driver::{IterationDriver, StageRun};
use crate::errors::ErrorKind;
use crate::events::{Cursor, Event, EventType};
use crate::pipeline::ParallelNode;
use crate::session::ParallelPaths;
use crate::state::{IterationRecord, SessionState, StateStore};

/// Identity of the block a manifest summarizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRef {
    pub name: String,
    pub index: usize,
}

/// Per-provider, per-stage summary inside the merge manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStageSummary {
    /// Absolute path of the stage's latest iteration output.
    pub latest_output: String,
    pub status: String,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    #[serde(default)]
    pub history: Vec<IterationRecord>,
}

/// `manifest.json`: the block's summary of every provider's outputs.
/// Exists iff every provider completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeManifest {
    pub block: BlockRef,
    /// provider -> stage id -> summary.
    pub providers: BTreeMap<String, BTreeMap<String, ProviderStageSummary>>,
}

impl MergeManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read merge manifest {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("merge manifest {} is corrupt", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let body =
            serde_json::to_string_pretty(self).context("failed to serialize merge manifest")?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write merge manifest {}", path.display()))?;
        Ok(())
    }

    /// Does any provider's map carry this stage id?
    pub fn has_stage(&self, stage: &str) -> bool {
        self.providers.values().any(|m| m.contains_key(stage))
    }
}

/// Terminal state of one worker, tracked in `resume.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// `resume.json`: worker states, rewritten after every change so crash
/// recovery knows which providers already finished.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeLedger {
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerEntry>,
}

impl ResumeLedger {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read resume ledger {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("resume ledger {} is corrupt", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(self).context("failed to serialize ledger")?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write resume ledger {}", path.display()))?;
        Ok(())
    }

    pub fn set(&mut self, provider: &str, status: WorkerStatus, error: Option<String>) {
        self.workers.insert(
            provider.to_string(),
            WorkerEntry {
                status,
                error,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn completed(&self, provider: &str) -> bool {
        self.workers
            .get(provider)
            .is_some_and(|w| w.status == WorkerStatus::Completed)
    }
}

/// Outcome of running one parallel block.
#[derive(Debug)]
pub struct BlockOutcome {
    pub manifest_written: bool,
}

/// Drives one parallel node to completion.
pub struct ParallelCoordinator<'a> {
    driver: &'a IterationDriver,
}

impl<'a> ParallelCoordinator<'a> {
    pub fn new(driver: &'a IterationDriver) -> Self {
        Self { driver }
    }

    pub async fn run(
        &self,
        node: &ParallelNode,
        node_run: u32,
        session_state: &StateStore,
    ) -> Result<BlockOutcome> {
        let session = self.driver.session_name().to_string();
        let block_paths = ParallelPaths::new(self.driver.session_dir(), node.index, &node.id)?;
        std::fs::create_dir_all(block_paths.dir())
            .with_context(|| format!("failed to create {}", block_paths.dir().display()))?;

        let resume_path = block_paths.resume_path();
        let mut ledger = ResumeLedger::load(&resume_path)?;
        // A finished block being executed again (repeat run) starts a
        // fresh ledger; a half-finished one resumes.
        if block_paths.manifest_path().exists()
            && node.providers.iter().all(|p| ledger.completed(p))
        {
            ledger = ResumeLedger::default();
            std::fs::remove_file(block_paths.manifest_path())
                .with_context(|| "failed to clear stale merge manifest".to_string())?;
        }

        let mut join_set = tokio::task::JoinSet::new();
        for provider in &node.providers {
            if ledger.completed(provider) {
                // Finished before a crash; don't re-run it.
                continue;
            }
            ledger.set(provider, WorkerStatus::Running, None);

            let scope_root = block_paths.provider_scope(provider)?;
            std::fs::create_dir_all(&scope_root)
                .with_context(|| format!("failed to create {}", scope_root.display()))?;

            let provider = provider.clone();
            let node = node.clone();
            let driver = self.driver.clone();
            let session = session.clone();
            let state_path = block_paths.provider_state_path(&provider)?;
            join_set.spawn(async move {
                let result = run_worker(
                    &driver,
                    &node,
                    node_run,
                    &provider,
                    &scope_root,
                    &state_path,
                    &session,
                )
                .await;
                (provider, result)
            });
        }
        ledger.write(&resume_path)?;

        let mut first_error: Option<(String, anyhow::Error)> = None;
        while let Some(joined) = join_set.join_next().await {
            let (provider, result) = joined.context("parallel worker panicked")?;
            match result {
                Ok(()) => {
                    ledger.set(&provider, WorkerStatus::Completed, None);
                    self.driver.emit(
                        Event::new(EventType::WorkerComplete, &session).with_cursor(
                            Cursor::new(node.path.clone(), node_run, 0).with_provider(&provider),
                        ),
                    )?;
                }
                Err(e) => {
                    ledger.set(&provider, WorkerStatus::Failed, Some(e.to_string()));
                    self.driver.emit(
                        Event::new(EventType::Error, &session)
                            .with_cursor(
                                Cursor::new(node.path.clone(), node_run, 0)
                                    .with_provider(&provider),
                            )
                            .with_data(json!({"message": e.to_string()})),
                    )?;
                    if first_error.is_none() {
                        first_error = Some((provider.clone(), e));
                    }
                }
            }
            ledger.write(&resume_path)?;
        }

        if let Some((provider, error)) = first_error {
            // Partial failure: no manifest, block failed, session failed.
            session_state.mark_failed(
                ErrorKind::ProviderCrashed,
                &format!("parallel provider '{}' failed: {}", provider, error),
            )?;
            return Err(error.context(format!(
                "parallel block '{}' failed in provider '{}'",
                node.id, provider
            )));
        }

        let manifest = self.collect_manifest(node, &block_paths)?;
        manifest.write(&block_paths.manifest_path())?;
        Ok(BlockOutcome {
            manifest_written: true,
        })
    }

    /// Assemble the merge manifest from each provider's isolated state and
    /// stage outputs. Called only after every worker succeeded.
    fn collect_manifest(
        &self,
        node: &ParallelNode,
        block_paths: &ParallelPaths,
    ) -> Result<MergeManifest> {
        let mut providers = BTreeMap::new();
        for provider in &node.providers {
            let scope_root = block_paths.provider_scope(provider)?;
            let state = StateStore::new(block_paths.provider_state_path(provider)?).load()?;
            let mut stages = BTreeMap::new();
            for stage in &node.stages {
                let stage_paths =
                    crate::session::StagePaths::new(&scope_root, stage.index, &stage.id)?;
                let iterations = latest_iteration(&stage_paths)?;
                let latest_output = stage_paths.iteration_output_path(iterations);
                stages.insert(
                    stage.id.clone(),
                    ProviderStageSummary {
                        latest_output: latest_output.to_string_lossy().into_owned(),
                        status: state.status.as_str().to_string(),
                        iterations,
                        termination_reason: state
                            .history
                            .last()
                            .map(|r| r.decision.as_str().to_string()),
                        history: state.history.clone(),
                    },
                );
            }
            providers.insert(provider.clone(), stages);
        }
        Ok(MergeManifest {
            block: BlockRef {
                name: node.id.clone(),
                index: node.index,
            },
            providers,
        })
    }
}

/// Run the inner stage sequence for one provider inside its scope.
async fn run_worker(
    driver: &IterationDriver,
    node: &ParallelNode,
    node_run: u32,
    provider: &str,
    scope_root: &Path,
    state_path: &Path,
    session: &str,
) -> Result<()> {
    driver.emit(
        Event::new(EventType::ParallelProviderStart, session)
            .with_cursor(Cursor::new(node.path.clone(), node_run, 0).with_provider(provider)),
    )?;

    // Provider-isolated state: termination history must not leak between
    // workers.
    let store = StateStore::new(state_path);
    match store.exists().then(|| store.load()).transpose()? {
        None => store.write(&SessionState::new(session, "parallel", &node.id))?,
        Some(state) if state.status.is_terminal() => {
            // Repeat run of a finished block starts over.
            store.write(&SessionState::new(session, "parallel", &node.id))?;
        }
        Some(state) if state.status == crate::state::SessionStatus::Failed => {
            store.mark_resumed().map(|_| ())?;
        }
        Some(_) => {}
    }

    for stage in &node.stages {
        let mut stage = stage.clone();
        stage.provider = provider.to_string();
        let run = StageRun {
            stage: &stage,
            node_path: stage.path.clone(),
            node_run,
            scope_root: Some(scope_root.to_path_buf()),
            provider_cursor: Some(provider.to_string()),
        };
        let key = run.node_key();
        if store.load()?.completed_stages.contains(&key) {
            // A crashed worker resumes past inner stages it finished.
            continue;
        }
        driver.run_stage(&run, &store).await?;
        store.update(|s| {
            if !s.completed_stages.contains(&key) {
                s.completed_stages.push(key.clone());
            }
        })?;
    }
    // The manifest reports terminal worker state; completed means every
    // inner stage ran to its termination.
    store.mark_completed()?;

    driver.emit(
        Event::new(EventType::ParallelProviderComplete, session)
            .with_cursor(Cursor::new(node.path.clone(), node_run, 0).with_provider(provider)),
    )?;
    Ok(())
}

/// Highest iteration index with a recorded output under a stage dir.
fn latest_iteration(stage_paths: &crate::session::StagePaths) -> Result<u32> {
    let iterations_dir = stage_paths.dir().join("iterations");
    let mut latest = 0;
    if iterations_dir.exists() {
        for entry in std::fs::read_dir(&iterations_dir)? {
            let entry = entry?;
            if let Ok(n) = entry.file_name().to_string_lossy().parse::<u32>() {
                latest = latest.max(n);
            }
        }
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Decision;
    use tempfile::tempdir;

    #[test]
    fn manifest_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest = MergeManifest {
            block: BlockRef {
                name: "impls".into(),
                index: 1,
            },
            providers: BTreeMap::from([(
                "claude".to_string(),
                BTreeMap::from([(
                    "implement".to_string(),
                    ProviderStageSummary {
                        latest_output: "/x/output.md".into(),
                        status: "completed".into(),
                        iterations: 2,
                        termination_reason: Some("stop".into()),
                        history: vec![IterationRecord {
                            iteration: 1,
                            decision: Decision::Stop,
                            summary: None,
                            items_completed: None,
                            files_touched: None,
                            plateau: None,
                            timestamp: Utc::now(),
                        }],
                    },
                )]),
            )]),
        };
        manifest.write(&path).unwrap();
        let loaded = MergeManifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);
        assert!(loaded.has_stage("implement"));
        assert!(!loaded.has_stage("review"));
    }

    #[test]
    fn ledger_tracks_worker_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume.json");
        let mut ledger = ResumeLedger::default();
        ledger.set("claude", WorkerStatus::Running, None);
        ledger.set("codex", WorkerStatus::Failed, Some("exit 2".into()));
        ledger.write(&path).unwrap();

        let loaded = ResumeLedger::load(&path).unwrap();
        assert!(!loaded.completed("claude"));
        assert_eq!(loaded.workers["codex"].status, WorkerStatus::Failed);
        assert_eq!(loaded.workers["codex"].error.as_deref(), Some("exit 2"));

        let mut loaded = loaded;
        loaded.set("claude", WorkerStatus::Completed, None);
        assert!(loaded.completed("claude"));
    }

    #[test]
    fn missing_ledger_is_empty() {
        let dir = tempdir().unwrap();
        let ledger = ResumeLedger::load(&dir.path().join("resume.json")).unwrap();
        assert!(ledger.workers.is_empty());
    }
}
