//! Consensus-based termination with optional judge override.

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use super::judge::JudgeRunner;
use super::{PolicyContext, TerminationDecision, TerminationPolicy};
use crate::pipeline::JudgeConfig;
use crate::report::Decision;

/// Never stop before `min_iterations`; afterwards stop when the last
/// `consensus` results all decided stop. A configured judge overrides the
/// consensus verdict; after three consecutive judge failures the judge is
/// permanently disabled for the stage.
pub struct JudgmentPolicy {
    min_iterations: u32,
    consensus: u32,
    judge: Option<JudgeRunner>,
    judge_failures: u32,
    judge_disabled: bool,
}

const JUDGE_FAILURE_LIMIT: u32 = 3;

impl JudgmentPolicy {
    pub fn new(min_iterations: u32, consensus: u32, judge: Option<JudgeConfig>) -> Self {
        Self {
            min_iterations,
            consensus,
            judge: judge.map(JudgeRunner::new),
            judge_failures: 0,
            judge_disabled: false,
        }
    }

    fn consensus_reached(&self, cx: &PolicyContext<'_>) -> bool {
        let history = &cx.state.history;
        if history.len() < self.consensus as usize {
            return false;
        }
        history
            .iter()
            .rev()
            .take(self.consensus as usize)
            .all(|r| r.decision == Decision::Stop)
    }
}

#[async_trait]
impl TerminationPolicy for JudgmentPolicy {
    fn name(&self) -> &'static str {
        "judgment"
    }

    async fn decide(&mut self, cx: &PolicyContext<'_>) -> Result<TerminationDecision> {
        if cx.state.iteration_completed < self.min_iterations {
            return Ok(TerminationDecision::Continue);
        }

        let consensus = self.consensus_reached(cx);

        if let Some(judge) = &self.judge {
            if !self.judge_disabled {
                match judge.run(cx).await {
                    Ok(verdict) => {
                        self.judge_failures = 0;
                        return Ok(if verdict.stop {
                            TerminationDecision::stop(format!(
                                "judge: {}",
                                verdict.reason.as_deref().unwrap_or("stop")
                            ))
                        } else {
                            TerminationDecision::Continue
                        });
                    }
                    Err(e) => {
                        self.judge_failures += 1;
                        warn!(
                            failures = self.judge_failures,
                            error = %e,
                            "judge invocation failed"
                        );
                        if self.judge_failures >= JUDGE_FAILURE_LIMIT {
                            self.judge_disabled = true;
                            warn!("judge disabled for this stage: judge_unreliable");
                        }
                        // Fall back to consensus below.
                    }
                }
            }
        }

        if consensus {
            Ok(TerminationDecision::stop(format!(
                "last {} results decided stop",
                self.consensus
            )))
        } else {
            Ok(TerminationDecision::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{stage_node, state_with_decisions};
    use super::*;
    use crate::events::{Cursor, EventLog};
    use crate::pipeline::TerminationConfig;
    use crate::provider::ProviderRegistry;
    use crate::session::StagePaths;
    use tokio_util::sync::CancellationToken;

    async fn decide(
        policy: &mut JudgmentPolicy,
        decisions: &[Decision],
    ) -> TerminationDecision {
        let dir = tempfile::tempdir().unwrap();
        let stage = stage_node(TerminationConfig::Judgment {
            min_iterations: policy.min_iterations,
            consensus: policy.consensus,
            judge: None,
        });
        let stage_paths = StagePaths::new(dir.path(), 0, "stage").unwrap();
        let events = EventLog::new(dir.path().join("events.jsonl"));
        let registry = ProviderRegistry::new();
        let cancel = CancellationToken::new();
        let state = state_with_decisions(decisions);
        let cx = PolicyContext {
            session: "alpha",
            state: &state,
            stage: &stage,
            stage_paths: &stage_paths,
            iteration: decisions.len() as u32,
            cursor: Cursor::new("0", 0, decisions.len() as u32),
            events: &events,
            registry: &registry,
            cancel: &cancel,
            templates_dir: dir.path(),
            work_dir: dir.path(),
        };
        policy.decide(&cx).await.unwrap()
    }

    #[tokio::test]
    async fn never_stops_before_min_iterations() {
        let mut policy = JudgmentPolicy::new(3, 1, None);
        let decision = decide(&mut policy, &[Decision::Stop, Decision::Stop]).await;
        assert_eq!(decision, TerminationDecision::Continue);
    }

    #[tokio::test]
    async fn consensus_window_must_be_unanimous() {
        // min=2, consensus=2: [continue, continue, stop] has one stop in
        // the window, so it continues; the fourth stop closes the window.
        let mut policy = JudgmentPolicy::new(2, 2, None);
        let decision = decide(
            &mut policy,
            &[Decision::Continue, Decision::Continue, Decision::Stop],
        )
        .await;
        assert_eq!(decision, TerminationDecision::Continue);

        let decision = decide(
            &mut policy,
            &[
                Decision::Continue,
                Decision::Continue,
                Decision::Stop,
                Decision::Stop,
            ],
        )
        .await;
        assert!(decision.is_stop());
    }

    #[tokio::test]
    async fn continue_breaks_the_streak() {
        let mut policy = JudgmentPolicy::new(1, 2, None);
        let decision = decide(
            &mut policy,
            &[Decision::Stop, Decision::Continue, Decision::Stop],
        )
        .await;
        assert_eq!(decision, TerminationDecision::Continue);
    }
}
