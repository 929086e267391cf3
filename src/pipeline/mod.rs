//! Pipeline and loop definitions, and their compiled execution plans.
//!
//! - `def` — the YAML-facing definition types (`PipelineDef`, `StageDef`,
//!   `TerminationConfig`, `InputsSpec`) plus lint validation
//! - `plan` — the compiled, cached `Plan` with ordered `Node`s

mod def;
mod plan;

pub use def::{
    FromParallelItem, FromParallelSpec, InputsSpec, JudgeConfig, LintIssue, ParallelDef,
    ParallelRef, PipelineDef, StageDef, StageSelect, TerminationConfig, lint,
};
pub use plan::{Node, Overrides, ParallelNode, Plan, StageNode, compile, load_or_compile};
