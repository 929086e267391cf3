//! Per-iteration context manifest.
//!
//! `context.json` is the single document an agent may consume: identity,
//! paths it owns, resolved inputs, limits, and the commands map. The
//! engine writes it; agents only read. Inside a parallel block, input
//! resolution consults the provider's isolated scope first and falls back
//! to the pipeline root.

use anyhow::{Context as _, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::parallel::{MergeManifest, ProviderStageSummary};
use crate::pipeline::{ParallelRef, Plan, StageNode, StageSelect};
use crate::session::{SessionPaths, StagePaths};

/// Stage identity block of the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRef {
    pub id: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Paths the agent may read and (for output/result/progress) write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMap {
    pub session_dir: String,
    pub stage_dir: String,
    pub progress: String,
    pub output: String,
    pub status: String,
    pub result: String,
}

/// Iteration limits advertised to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub max_iterations: u32,
    /// Seconds left before the session deadline; -1 when unbounded.
    pub remaining_seconds: i64,
}

/// Scope block present only inside a parallel worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelScope {
    pub scope_root: PathBuf,
    pub pipeline_root: PathBuf,
}

/// Resolution of one `from_parallel` reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedParallelRef {
    pub stage: String,
    pub block: String,
    pub providers: BTreeMap<String, ProviderSummary>,
}

/// Per-provider view handed to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSummary {
    pub output: String,
    pub status: String,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<crate::state::IterationRecord>>,
}

impl ProviderSummary {
    fn from_manifest(summary: &ProviderStageSummary, include_history: bool) -> Self {
        Self {
            output: summary.latest_output.clone(),
            status: summary.status.clone(),
            iterations: summary.iterations,
            termination_reason: summary.termination_reason.clone(),
            history: include_history.then(|| summary.history.clone()),
        }
    }
}

/// `from_parallel` resolves to one reference or an ordered list, matching
/// the shape the definition used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResolvedFromParallel {
    One(ResolvedParallelRef),
    Many(Vec<ResolvedParallelRef>),
}

/// Resolved inputs block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInputs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from_initial: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub from_stage: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from_previous_iterations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_parallel: Option<ResolvedFromParallel>,
}

/// The manifest written as `context.json` each iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextManifest {
    pub session: String,
    pub pipeline: String,
    pub stage: StageRef,
    pub iteration: u32,
    pub paths: PathMap,
    pub inputs: ResolvedInputs,
    pub limits: Limits,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_scope: Option<ParallelScope>,
}

impl ContextManifest {
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(self).context("failed to serialize context")?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Builds the manifest for one iteration.
pub struct ContextBuilder<'a> {
    plan: &'a Plan,
    session: &'a SessionPaths,
    project_dir: &'a Path,
    /// Set inside a parallel worker.
    scope: Option<ParallelScope>,
    started_at: DateTime<Utc>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(
        plan: &'a Plan,
        session: &'a SessionPaths,
        project_dir: &'a Path,
        scope: Option<ParallelScope>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            plan,
            session,
            project_dir,
            scope,
            started_at,
        }
    }

    /// The directory stages of this run live under: the provider scope
    /// inside a parallel worker, the session dir otherwise.
    fn stage_root(&self) -> &Path {
        self.scope
            .as_ref()
            .map(|s| s.scope_root.as_path())
            .unwrap_or_else(|| self.session.session_dir())
    }

    pub fn build(
        &self,
        stage: &StageNode,
        stage_paths: &StagePaths,
        iteration: u32,
    ) -> Result<ContextManifest> {
        let inputs = self.resolve_inputs(stage, stage_paths, iteration)?;
        let limits = Limits {
            max_iterations: stage.max_iterations,
            remaining_seconds: remaining_seconds(
                self.plan.max_runtime_seconds,
                self.started_at,
                Utc::now(),
            ),
        };

        Ok(ContextManifest {
            session: self.session.session().to_string(),
            pipeline: self.plan.pipeline.clone(),
            stage: StageRef {
                id: stage.id.clone(),
                index: stage.index,
                template: stage.template.clone(),
            },
            iteration,
            paths: PathMap {
                session_dir: display(self.session.session_dir()),
                stage_dir: display(stage_paths.dir()),
                progress: display(&self.progress_path(stage_paths)),
                output: display(&stage_paths.iteration_output_path(iteration)),
                status: display(&stage_paths.status_path(iteration)),
                result: display(&stage_paths.result_path(iteration)),
            },
            inputs,
            limits,
            commands: self.plan.commands.clone(),
            parallel_scope: self.scope.clone(),
        })
    }

    /// The stage progress file, falling back to the legacy session-level
    /// file when the stage has none yet but the legacy one exists.
    fn progress_path(&self, stage_paths: &StagePaths) -> PathBuf {
        let stage_progress = stage_paths.progress_path();
        let legacy = self.session.legacy_progress_path();
        if !stage_progress.exists() && legacy.exists() {
            legacy
        } else {
            stage_progress
        }
    }

    fn resolve_inputs(
        &self,
        stage: &StageNode,
        stage_paths: &StagePaths,
        iteration: u32,
    ) -> Result<ResolvedInputs> {
        let spec = &stage.inputs;
        let mut resolved = ResolvedInputs::default();

        if spec.from_initial {
            for input in &self.plan.initial_inputs {
                let absolute = if input.is_absolute() {
                    input.clone()
                } else {
                    self.project_dir.join(input)
                };
                resolved.from_initial.push(display(&absolute));
            }
        }

        for (id, select) in &spec.from_stage {
            let outputs = self.stage_outputs(id, *select)?;
            resolved.from_stage.insert(id.clone(), outputs);
        }

        if spec.from_previous_iterations {
            for prior in 1..iteration {
                let output = stage_paths.iteration_output_path(prior);
                if output.exists() {
                    resolved
                        .from_previous_iterations
                        .push(display(&output));
                }
            }
        }

        if let Some(from_parallel) = &spec.from_parallel {
            let refs = from_parallel.refs();
            let mut resolved_refs = Vec::with_capacity(refs.len());
            for r in &refs {
                resolved_refs.push(self.resolve_parallel_ref(r)?);
            }
            resolved.from_parallel = Some(match from_parallel {
                crate::pipeline::FromParallelSpec::Many(_) => {
                    ResolvedFromParallel::Many(resolved_refs)
                }
                _ => ResolvedFromParallel::One(
                    resolved_refs.into_iter().next().context(
                        "from_parallel resolved to nothing",
                    )?,
                ),
            });
        }

        Ok(resolved)
    }

    /// Outputs of a named prior stage: scope first, pipeline root second.
    fn stage_outputs(&self, id: &str, select: StageSelect) -> Result<Vec<String>> {
        let mut roots: Vec<&Path> = vec![self.stage_root()];
        if let Some(scope) = &self.scope {
            roots.push(scope.pipeline_root.as_path());
        }
        for root in roots {
            if let Some(stage_dir) = find_prefixed_dir(root, "stage-", id)? {
                let outputs = iteration_outputs(&stage_dir)?;
                if outputs.is_empty() {
                    continue;
                }
                return Ok(match select {
                    StageSelect::Latest => vec![outputs
                        .last()
                        .map(|p| display(p))
                        .unwrap_or_default()],
                    StageSelect::All => outputs.iter().map(|p| display(p)).collect(),
                });
            }
        }
        bail!("from_stage '{}': no completed outputs found", id)
    }

    /// Locate the referenced block's merge manifest and project the
    /// requested provider subset out of it.
    fn resolve_parallel_ref(&self, r: &ParallelRef) -> Result<ResolvedParallelRef> {
        let root = self
            .scope
            .as_ref()
            .map(|s| s.pipeline_root.as_path())
            .unwrap_or_else(|| self.session.session_dir());

        let mut candidates = parallel_dirs(root)?;
        // Latest block first, so an unqualified stage id resolves to the
        // most recent block that produced it.
        candidates.reverse();

        for dir in candidates {
            if let Some(block) = &r.block {
                if !dir_matches_id(&dir, "parallel-", block) {
                    continue;
                }
            }
            let manifest_path = dir.join("manifest.json");
            if !manifest_path.exists() {
                continue;
            }
            let manifest = MergeManifest::load(&manifest_path)?;
            if !manifest.has_stage(&r.stage) {
                continue;
            }

            let include_history = r.select == Some(StageSelect::All);
            let mut providers = BTreeMap::new();
            for (provider, stages) in &manifest.providers {
                if let Some(filter) = &r.providers {
                    if !filter.iter().any(|p| p.eq_ignore_ascii_case(provider)) {
                        continue;
                    }
                }
                if let Some(summary) = stages.get(&r.stage) {
                    providers.insert(
                        provider.clone(),
                        ProviderSummary::from_manifest(summary, include_history),
                    );
                }
            }
            if providers.is_empty() {
                bail!(
                    "from_parallel '{}': provider filter matched nothing in block '{}'",
                    r.stage,
                    manifest.block.name
                );
            }
            return Ok(ResolvedParallelRef {
                stage: r.stage.clone(),
                block: manifest.block.name.clone(),
                providers,
            });
        }
        bail!(
            "from_parallel '{}': no prior parallel block has a merge manifest for it",
            r.stage
        )
    }
}

/// `remaining_seconds` semantics: -1 when unbounded, else clamped to 0.
pub fn remaining_seconds(
    max_runtime_seconds: Option<u64>,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> i64 {
    match max_runtime_seconds {
        None => -1,
        Some(max) => {
            let elapsed = (now - started_at).num_seconds().max(0);
            (max as i64 - elapsed).max(0)
        }
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Find `"<prefix>NN-<id>"` under a root, highest NN when repeated.
fn find_prefixed_dir(root: &Path, prefix: &str, id: &str) -> Result<Option<PathBuf>> {
    if !root.exists() {
        return Ok(None);
    }
    let mut best: Option<PathBuf> = None;
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("failed to scan {}", root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        if dir_matches_id(&path, prefix, id) {
            match &best {
                Some(current) if current.file_name() > path.file_name() => {}
                _ => best = Some(path),
            }
        }
    }
    Ok(best)
}

/// Exact match on `"<prefix>NN-<id>"`: the index must be numeric and the
/// id must match whole, so `plan` never matches `my-plan`.
fn dir_matches_id(path: &Path, prefix: &str, id: &str) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Some(rest) = name.strip_prefix(prefix) else {
        return false;
    };
    match rest.split_once('-') {
        Some((index, rest_id)) => {
            !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) && rest_id == id
        }
        None => false,
    }
}

/// All parallel block dirs under a root, in name (index) order.
fn parallel_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !root.exists() {
        return Ok(dirs);
    }
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("failed to scan {}", root.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("parallel-"))
        {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Iteration outputs of a stage dir, in iteration order.
fn iteration_outputs(stage_dir: &Path) -> Result<Vec<PathBuf>> {
    let iterations = stage_dir.join("iterations");
    let mut outputs = Vec::new();
    if !iterations.exists() {
        return Ok(outputs);
    }
    let mut entries: Vec<_> = std::fs::read_dir(&iterations)
        .with_context(|| format!("failed to scan {}", iterations.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let output = entry.path().join("output.md");
        if output.exists() {
            outputs.push(output);
        }
    }
    Ok(outputs)
}
