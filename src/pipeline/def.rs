//! YAML-facing definition types for loops and pipelines.
//!
//! A loop is a single-stage pipeline in a `.conductor/loops/<name>.yaml`
//! file; a pipeline lists stages, some of which may be parallel blocks.
//! Deprecated input key names (`initial`, `previous`, `stage`) are accepted
//! as aliases and normalized on parse.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level pipeline (or loop) definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Pipeline-level provider default.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_runtime_seconds: Option<u64>,
    /// Commands advertised to agents through the context manifest.
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
    /// Pipeline-level initial input paths.
    #[serde(default, alias = "inputs")]
    pub initial_inputs: Vec<PathBuf>,
    #[serde(default)]
    pub stages: Vec<StageDef>,
}

impl PipelineDef {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse pipeline YAML {}", path.display()))
    }

    /// Wrap a loop definition (one stage, no `stages` list) into the
    /// single-stage pipeline it is.
    pub fn from_loop(path: &Path, loop_name: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read loop file {}", path.display()))?;
        let stage: StageDef = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse loop YAML {}", path.display()))?;

        let mut def = PipelineDef {
            name: Some(stage.name.clone().unwrap_or_else(|| loop_name.to_string())),
            provider: stage.provider.clone(),
            model: stage.model.clone(),
            max_runtime_seconds: stage.max_runtime_seconds,
            commands: stage.commands.clone(),
            initial_inputs: stage.initial_inputs.clone(),
            ..PipelineDef::default()
        };
        let mut stage = stage;
        if stage.id.is_empty() {
            stage.id = loop_name.to_string();
        }
        def.stages = vec![stage];
        Ok(def)
    }
}

/// One stage entry. Either a regular stage (`template`/`prompt`) or a
/// parallel block (`parallel`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageDef {
    #[serde(default)]
    pub id: String,
    /// Loop files may carry their own name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Named prompt template under `.conductor/templates/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Inline prompt text, for definitions that carry their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// How many times this node repeats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<InputsSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_inputs: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelDef>,
}

/// Parallel fan-out: every provider runs the inner stage sequence against
/// its own isolated scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelDef {
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub stages: Vec<StageDef>,
}

/// Termination strategy configuration, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminationConfig {
    /// Stop after exactly `count` completed iterations.
    Fixed { count: u32 },
    /// Stop when the last `consensus` results all said stop, never before
    /// `min_iterations`. An optional judge can override.
    Judgment {
        #[serde(default = "default_min_iterations")]
        min_iterations: u32,
        #[serde(default = "default_consensus")]
        consensus: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        judge: Option<JudgeConfig>,
    },
    /// Stop when the external queue command reports nothing pending.
    Queue { command: String },
}

fn default_min_iterations() -> u32 {
    2
}

fn default_consensus() -> u32 {
    2
}

impl TerminationConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            TerminationConfig::Fixed { .. } => "fixed",
            TerminationConfig::Judgment { .. } => "judgment",
            TerminationConfig::Queue { .. } => "queue",
        }
    }
}

/// Judge subroutine configuration for judgment termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Which iterations of a prior stage to hand over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageSelect {
    #[default]
    Latest,
    All,
}

/// The stage's inputs specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputsSpec {
    #[serde(default, alias = "initial")]
    pub from_initial: bool,
    #[serde(default, alias = "stage", skip_serializing_if = "BTreeMap::is_empty")]
    pub from_stage: BTreeMap<String, StageSelect>,
    #[serde(default, alias = "previous")]
    pub from_previous_iterations: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_parallel: Option<FromParallelSpec>,
}

/// `from_parallel` accepts a stage-id shorthand string, a reference
/// object, or an ordered array of either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FromParallelSpec {
    Stage(String),
    Ref(ParallelRef),
    Many(Vec<FromParallelItem>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FromParallelItem {
    Stage(String),
    Ref(ParallelRef),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelRef {
    pub stage: String,
    /// Parallel block id, when the stage id alone is ambiguous.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
    /// Restrict to a subset of the block's providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<StageSelect>,
}

impl FromParallelSpec {
    /// Flatten to the ordered reference list the resolver walks.
    pub fn refs(&self) -> Vec<ParallelRef> {
        fn item_to_ref(item: &FromParallelItem) -> ParallelRef {
            match item {
                FromParallelItem::Stage(stage) => ParallelRef {
                    stage: stage.clone(),
                    ..ParallelRef::default()
                },
                FromParallelItem::Ref(r) => r.clone(),
            }
        }
        match self {
            FromParallelSpec::Stage(stage) => vec![ParallelRef {
                stage: stage.clone(),
                ..ParallelRef::default()
            }],
            FromParallelSpec::Ref(r) => vec![r.clone()],
            FromParallelSpec::Many(items) => items.iter().map(item_to_ref).collect(),
        }
    }
}

/// One lint finding: where, and what is wrong.
#[derive(Debug, Clone, PartialEq)]
pub struct LintIssue {
    pub location: String,
    pub message: String,
}

impl std::fmt::Display for LintIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// Validate a definition, collecting every problem rather than stopping at
/// the first. Compilation refuses definitions with any issue.
pub fn lint(def: &PipelineDef) -> Vec<LintIssue> {
    let mut issues = Vec::new();
    let push = |issues: &mut Vec<LintIssue>, location: String, message: String| {
        issues.push(LintIssue { location, message });
    };

    if def.stages.is_empty() {
        push(
            &mut issues,
            "pipeline".into(),
            "definition has no stages".into(),
        );
    }

    // Ids of parallel blocks and their inner stages, in plan order, for
    // from_parallel reference checks.
    let mut seen_stage_ids: Vec<String> = Vec::new();
    let mut prior_parallel_stages: Vec<(String, String)> = Vec::new(); // (block, stage)

    for (index, stage) in def.stages.iter().enumerate() {
        let loc = if stage.id.is_empty() {
            format!("stages[{}]", index)
        } else {
            format!("stage '{}'", stage.id)
        };

        if stage.id.is_empty() {
            push(&mut issues, loc.clone(), "missing id".into());
        }

        if let Some(parallel) = &stage.parallel {
            if stage.template.is_some() || stage.prompt.is_some() {
                push(
                    &mut issues,
                    loc.clone(),
                    "parallel block cannot also declare a template or prompt".into(),
                );
            }
            if parallel.providers.is_empty() {
                push(
                    &mut issues,
                    loc.clone(),
                    "parallel block needs at least one provider".into(),
                );
            }
            if parallel.stages.is_empty() {
                push(
                    &mut issues,
                    loc.clone(),
                    "parallel block needs at least one inner stage".into(),
                );
            }
            for inner in &parallel.stages {
                let inner_loc = format!("{} / stage '{}'", loc, inner.id);
                if inner.provider.is_some() {
                    push(
                        &mut issues,
                        inner_loc.clone(),
                        "inner stages inherit the block provider and cannot redeclare one".into(),
                    );
                }
                if inner.parallel.is_some() {
                    push(
                        &mut issues,
                        inner_loc.clone(),
                        "parallel blocks do not nest".into(),
                    );
                }
                lint_stage_common(inner, &inner_loc, &seen_stage_ids, &mut issues);
                lint_from_parallel(inner, &inner_loc, &prior_parallel_stages, &mut issues);
            }
        } else {
            if stage.template.is_none() && stage.prompt.is_none() {
                push(
                    &mut issues,
                    loc.clone(),
                    "stage needs a template or an inline prompt".into(),
                );
            }
            lint_stage_common(stage, &loc, &seen_stage_ids, &mut issues);
            lint_from_parallel(stage, &loc, &prior_parallel_stages, &mut issues);
        }

        // Record ids only after checking this stage, so self-references and
        // references to the enclosing block are caught.
        if let Some(parallel) = &stage.parallel {
            for inner in &parallel.stages {
                seen_stage_ids.push(inner.id.clone());
                prior_parallel_stages.push((stage.id.clone(), inner.id.clone()));
            }
        } else {
            seen_stage_ids.push(stage.id.clone());
        }
    }

    // Duplicate top-level ids make path lookups ambiguous.
    let mut sorted = seen_stage_ids.clone();
    sorted.sort();
    sorted.dedup();
    if sorted.len() != seen_stage_ids.len() {
        push(
            &mut issues,
            "pipeline".into(),
            "stage ids must be unique".into(),
        );
    }

    issues
}

fn lint_stage_common(
    stage: &StageDef,
    loc: &str,
    seen_stage_ids: &[String],
    issues: &mut Vec<LintIssue>,
) {
    if let Some(TerminationConfig::Fixed { count }) = &stage.termination {
        if *count == 0 {
            issues.push(LintIssue {
                location: loc.to_string(),
                message: "fixed termination needs count >= 1".into(),
            });
        }
    }
    if let Some(TerminationConfig::Judgment { consensus, .. }) = &stage.termination {
        if *consensus == 0 {
            issues.push(LintIssue {
                location: loc.to_string(),
                message: "judgment termination needs consensus >= 1".into(),
            });
        }
    }
    if let Some(TerminationConfig::Queue { command }) = &stage.termination {
        if command.trim().is_empty() {
            issues.push(LintIssue {
                location: loc.to_string(),
                message: "queue termination needs a command".into(),
            });
        }
    }
    if let Some(inputs) = &stage.inputs {
        for referenced in inputs.from_stage.keys() {
            if !seen_stage_ids.contains(referenced) {
                issues.push(LintIssue {
                    location: loc.to_string(),
                    message: format!("from_stage references unknown prior stage '{}'", referenced),
                });
            }
        }
    }
}

fn lint_from_parallel(
    stage: &StageDef,
    loc: &str,
    prior_parallel_stages: &[(String, String)],
    issues: &mut Vec<LintIssue>,
) {
    let Some(spec) = stage.inputs.as_ref().and_then(|i| i.from_parallel.as_ref()) else {
        return;
    };
    for r in spec.refs() {
        let known = prior_parallel_stages.iter().any(|(block, inner)| {
            inner == &r.stage && r.block.as_ref().is_none_or(|b| b == block)
        });
        if !known {
            issues.push(LintIssue {
                location: loc.to_string(),
                message: format!(
                    "from_parallel must reference a stage of a prior parallel block ('{}' is not one)",
                    r.stage
                ),
            });
        }
    }
}
