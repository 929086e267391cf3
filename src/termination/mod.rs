//! Termination strategies.
//!
//! Three built-ins decide when a stage stops iterating:
//! - `fixed` — after exactly N completed iterations
//! - `judgment` — result consensus, optionally overridden by a judge agent
//! - `queue` — when an external queue command reports nothing pending
//!
//! Policies consult the history appended to state after each iteration.
//! They never see raw agent output; decisions come from `result.json`.

mod fixed;
mod judge;
mod judgment;
mod queue;

pub use fixed::FixedPolicy;
pub use judge::{JudgeRunner, JudgeVerdict};
pub use judgment::JudgmentPolicy;
pub use queue::{CommandQueue, QueuePolicy, QueueSource};

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::events::{Cursor, EventLog};
use crate::pipeline::{StageNode, TerminationConfig};
use crate::provider::ProviderRegistry;
use crate::session::StagePaths;
use crate::state::SessionState;

/// Everything a policy may consult for one decision.
pub struct PolicyContext<'a> {
    pub session: &'a str,
    pub state: &'a SessionState,
    pub stage: &'a StageNode,
    pub stage_paths: &'a StagePaths,
    pub iteration: u32,
    pub cursor: Cursor,
    pub events: &'a EventLog,
    pub registry: &'a ProviderRegistry,
    pub cancel: &'a CancellationToken,
    pub templates_dir: &'a Path,
    pub work_dir: &'a Path,
}

/// A policy's verdict after an iteration completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationDecision {
    Continue,
    Stop { reason: String },
}

impl TerminationDecision {
    pub fn stop(reason: impl Into<String>) -> Self {
        TerminationDecision::Stop {
            reason: reason.into(),
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, TerminationDecision::Stop { .. })
    }
}

/// The strategy interface. Policies are stateful per stage instance (the
/// judgment policy tracks judge failures), so the driver owns one for the
/// duration of a stage.
#[async_trait]
pub trait TerminationPolicy: Send {
    fn name(&self) -> &'static str;

    async fn decide(&mut self, cx: &PolicyContext<'_>) -> Result<TerminationDecision>;
}

/// Instantiate the policy a stage's termination config names.
pub fn build_policy(config: &TerminationConfig) -> Box<dyn TerminationPolicy> {
    match config {
        TerminationConfig::Fixed { count } => Box::new(FixedPolicy::new(*count)),
        TerminationConfig::Judgment {
            min_iterations,
            consensus,
            judge,
        } => Box::new(JudgmentPolicy::new(*min_iterations, *consensus, judge.clone())),
        TerminationConfig::Queue { command } => {
            Box::new(QueuePolicy::new(CommandQueue::new(command.clone())))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::pipeline::{InputsSpec, TerminationConfig};
    use crate::report::Decision;
    use crate::state::{IterationRecord, SessionState};
    use chrono::Utc;

    pub fn stage_node(termination: TerminationConfig) -> StageNode {
        StageNode {
            path: "0".into(),
            index: 0,
            id: "stage".into(),
            template: None,
            prompt: Some("prompt".into()),
            provider: "claude".into(),
            model: None,
            runs: 1,
            delay_seconds: 0,
            max_iterations: 10,
            termination,
            inputs: InputsSpec::default(),
        }
    }

    pub fn state_with_decisions(decisions: &[Decision]) -> SessionState {
        let mut state = SessionState::new("alpha", "loop", "p");
        for (i, decision) in decisions.iter().enumerate() {
            state.history.push(IterationRecord {
                iteration: (i + 1) as u32,
                decision: *decision,
                summary: None,
                items_completed: None,
                files_touched: None,
                plateau: None,
                timestamp: Utc::now(),
            });
        }
        state.iteration_completed = decisions.len() as u32;
        state
    }
}
