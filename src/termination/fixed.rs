//! Fixed-count termination.

use anyhow::Result;
use async_trait::async_trait;

use super::{PolicyContext, TerminationDecision, TerminationPolicy};

/// Stop once the stage has completed exactly `count` iterations.
#[derive(Debug, Clone)]
pub struct FixedPolicy {
    count: u32,
}

impl FixedPolicy {
    pub fn new(count: u32) -> Self {
        Self { count }
    }
}

#[async_trait]
impl TerminationPolicy for FixedPolicy {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn decide(&mut self, cx: &PolicyContext<'_>) -> Result<TerminationDecision> {
        if cx.state.iteration_completed >= self.count {
            Ok(TerminationDecision::stop(format!(
                "completed {} of {} iterations",
                cx.state.iteration_completed, self.count
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
    use crate::report::Decision;
    use crate::session::StagePaths;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn stops_exactly_at_count() {
        let dir = tempfile::tempdir().unwrap();
        let stage = stage_node(TerminationConfig::Fixed { count: 3 });
        let stage_paths = StagePaths::new(dir.path(), 0, "stage").unwrap();
        let events = EventLog::new(dir.path().join("events.jsonl"));
        let registry = ProviderRegistry::new();
        let cancel = CancellationToken::new();
        let mut policy = FixedPolicy::new(3);

        for completed in 1..=3u32 {
            let state =
                state_with_decisions(&vec![Decision::Continue; completed as usize]);
            let cx = PolicyContext {
                session: "alpha",
                state: &state,
                stage: &stage,
                stage_paths: &stage_paths,
                iteration: completed,
                cursor: Cursor::new("0", 0, completed),
                events: &events,
                registry: &registry,
                cancel: &cancel,
                templates_dir: dir.path(),
                work_dir: dir.path(),
            };
            let decision = policy.decide(&cx).await.unwrap();
            if completed < 3 {
                assert_eq!(decision, TerminationDecision::Continue);
            } else {
                assert!(decision.is_stop());
            }
        }
    }
}
