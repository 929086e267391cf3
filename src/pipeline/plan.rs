//! Plan compilation and caching.
//!
//! A plan is the immutable, per-session compilation of a pipeline
//! definition: an ordered node list with stable dot-separated paths,
//! resolved termination configs, and CLI/env overrides projected in. It is
//! written to `plan.json` for inspection and restart determinism, and is
//! only regenerated when the source definition changes or regeneration is
//! requested.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::def::{InputsSpec, PipelineDef, StageDef, TerminationConfig, lint};

/// Default iteration cap when a stage declares none.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
/// Fallback provider when no layer of the precedence chain names one.
pub const DEFAULT_PROVIDER: &str = "claude";

/// Values projected onto the plan from the CLI and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub context: Option<String>,
    pub commands: BTreeMap<String, String>,
    pub initial_inputs: Vec<PathBuf>,
    /// Repeat count for the whole node sequence.
    pub runs: Option<u32>,
    pub max_iterations: Option<u32>,
}

/// The compiled plan, cached as `plan.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub pipeline: String,
    /// "loop" or "pipeline".
    pub kind: String,
    pub source: PathBuf,
    pub source_hash: String,
    pub compiled_at: DateTime<Utc>,
    pub runs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_seconds: Option<u64>,
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
    #[serde(default)]
    pub initial_inputs: Vec<PathBuf>,
    pub nodes: Vec<Node>,
}

impl Plan {
    pub fn node_by_path(&self, path: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.path() == path)
    }

    /// Total stage count including parallel inner stages, for display.
    pub fn stage_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| match n {
                Node::Stage(_) => 1,
                Node::Parallel(p) => p.stages.len(),
            })
            .sum()
    }
}

/// One plan entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Stage(StageNode),
    Parallel(ParallelNode),
}

impl Node {
    pub fn path(&self) -> &str {
        match self {
            Node::Stage(s) => &s.path,
            Node::Parallel(p) => &p.path,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Node::Stage(s) => &s.id,
            Node::Parallel(p) => &p.id,
        }
    }

    pub fn runs(&self) -> u32 {
        match self {
            Node::Stage(s) => s.runs,
            Node::Parallel(p) => p.runs,
        }
    }
}

/// A single-stage node with its resolved configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageNode {
    /// Stable identifier: "0", "1", or "2.0" for a parallel inner stage.
    pub path: String,
    /// Index used in the stage directory name.
    pub index: usize,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Resolved through the precedence chain at compile time.
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub runs: u32,
    pub delay_seconds: u64,
    pub max_iterations: u32,
    pub termination: TerminationConfig,
    #[serde(default)]
    pub inputs: InputsSpec,
}

/// A parallel fan-out node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelNode {
    pub path: String,
    pub index: usize,
    pub id: String,
    pub providers: Vec<String>,
    pub runs: u32,
    pub stages: Vec<StageNode>,
}

/// Compile a definition into a plan, applying the precedence chain
/// CLI/env override -> stage -> pipeline -> default.
pub fn compile(
    def: &PipelineDef,
    kind: &str,
    source: &Path,
    source_text: &str,
    overrides: &Overrides,
) -> Result<Plan> {
    let issues = lint(def);
    if !issues.is_empty() {
        let rendered = issues
            .iter()
            .map(|i| format!("  - {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("pipeline definition is invalid:\n{}", rendered);
    }

    let pipeline = def
        .name
        .clone()
        .or_else(|| {
            source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "pipeline".to_string());

    let mut commands = def.commands.clone();
    commands.extend(overrides.commands.clone());

    let mut initial_inputs = def.initial_inputs.clone();
    initial_inputs.extend(overrides.initial_inputs.iter().cloned());

    let resolve_provider = |stage: &StageDef| -> String {
        overrides
            .provider
            .clone()
            .or_else(|| stage.provider.clone())
            .or_else(|| def.provider.clone())
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string())
            .to_ascii_lowercase()
    };
    let resolve_model = |stage: &StageDef| -> Option<String> {
        overrides
            .model
            .clone()
            .or_else(|| stage.model.clone())
            .or_else(|| def.model.clone())
    };

    let compile_stage = |stage: &StageDef,
                         path: String,
                         index: usize,
                         provider: String,
                         model: Option<String>|
     -> StageNode {
        let max_iterations = overrides
            .max_iterations
            .or(stage.max_iterations)
            .unwrap_or(DEFAULT_MAX_ITERATIONS);
        let termination = stage
            .termination
            .clone()
            .unwrap_or(TerminationConfig::Fixed {
                count: max_iterations,
            });
        StageNode {
            path,
            index,
            id: stage.id.clone(),
            template: stage.template.clone(),
            prompt: stage.prompt.clone(),
            provider,
            model,
            runs: stage.runs.unwrap_or(1),
            delay_seconds: stage.delay_seconds.unwrap_or(0),
            max_iterations,
            termination,
            inputs: stage.inputs.clone().unwrap_or_default(),
        }
    };

    let mut nodes = Vec::with_capacity(def.stages.len());
    for (index, stage) in def.stages.iter().enumerate() {
        let path = index.to_string();
        if let Some(parallel) = &stage.parallel {
            let inner = parallel
                .stages
                .iter()
                .enumerate()
                .map(|(inner_index, inner_stage)| {
                    compile_stage(
                        inner_stage,
                        format!("{}.{}", path, inner_index),
                        inner_index,
                        // Inner stages inherit the worker's provider; the
                        // placeholder is replaced per worker at run time.
                        String::new(),
                        resolve_model(inner_stage),
                    )
                })
                .collect();
            nodes.push(Node::Parallel(ParallelNode {
                path,
                index,
                id: stage.id.clone(),
                providers: parallel
                    .providers
                    .iter()
                    .map(|p| p.to_ascii_lowercase())
                    .collect(),
                runs: stage.runs.unwrap_or(1),
                stages: inner,
            }));
        } else {
            let provider = resolve_provider(stage);
            let model = resolve_model(stage);
            nodes.push(Node::Stage(compile_stage(
                stage,
                path,
                index,
                provider,
                model,
            )));
        }
    }

    Ok(Plan {
        pipeline,
        kind: kind.to_string(),
        source: source.to_path_buf(),
        source_hash: hash_source(source_text),
        compiled_at: Utc::now(),
        runs: overrides.runs.unwrap_or(1),
        context: overrides.context.clone(),
        max_runtime_seconds: def.max_runtime_seconds,
        commands,
        initial_inputs,
        nodes,
    })
}

/// Reuse the cached `plan.json` when the source is unchanged; otherwise
/// compile and rewrite the cache.
pub fn load_or_compile(
    plan_path: &Path,
    def: &PipelineDef,
    kind: &str,
    source: &Path,
    source_text: &str,
    overrides: &Overrides,
    recompile: bool,
) -> Result<Plan> {
    if !recompile && plan_path.exists() {
        let cached: Result<Plan> = std::fs::read_to_string(plan_path)
            .context("failed to read plan cache")
            .and_then(|text| serde_json::from_str(&text).context("plan cache is corrupt"));
        match cached {
            Ok(plan) if plan.source_hash == hash_source(source_text) => {
                debug!(path = %plan_path.display(), "reusing cached plan");
                return Ok(plan);
            }
            Ok(_) => debug!("pipeline definition changed; recompiling plan"),
            Err(e) => debug!(error = %e, "plan cache unusable; recompiling"),
        }
    }

    let plan = compile(def, kind, source, source_text, overrides)?;
    if let Some(parent) = plan_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_string_pretty(&plan).context("failed to serialize plan")?;
    std::fs::write(plan_path, body)
        .with_context(|| format!("failed to write {}", plan_path.display()))?;
    Ok(plan)
}

fn hash_source(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
