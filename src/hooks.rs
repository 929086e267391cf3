//! Hook dispatch.
//!
//! Hooks are in-process callbacks pluggable at the engine's lifecycle
//! points. Registration order is preserved and execution is synchronous; a
//! hook never suspends the engine, it only returns a verdict. A panicking
//! hook is logged and treated as `Continue` unless the dispatcher is
//! configured strict.

use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use tracing::error;

use crate::report::AgentReport;
use crate::state::SessionState;

/// Where hooks can attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    SessionStart,
    SessionEnd,
    StageStart,
    StageEnd,
    IterationStart,
    IterationEnd,
    ParallelProviderStart,
    ParallelProviderEnd,
}

impl HookPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::SessionStart => "session_start",
            HookPoint::SessionEnd => "session_end",
            HookPoint::StageStart => "stage_start",
            HookPoint::StageEnd => "stage_end",
            HookPoint::IterationStart => "iteration_start",
            HookPoint::IterationEnd => "iteration_end",
            HookPoint::ParallelProviderStart => "parallel_provider_start",
            HookPoint::ParallelProviderEnd => "parallel_provider_end",
        }
    }
}

impl std::fmt::Display for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a hook tells the engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookVerdict {
    Continue,
    /// Persist state as paused, release the lock, exit cleanly.
    Pause,
    Abort,
    /// Restart the current stage from iteration 1.
    RestartStage,
    /// Continue, appending this text to the rendered prompt.
    ModifyContext(String),
}

/// What the dispatcher hands each hook.
#[derive(Debug, Clone)]
pub struct HookContext<'a> {
    pub session: &'a str,
    pub stage: Option<&'a str>,
    pub iteration: Option<u32>,
    pub provider: Option<&'a str>,
    pub state: &'a SessionState,
    pub last_report: Option<&'a AgentReport>,
    /// Accumulated progress text for the current stage, when present.
    pub progress: Option<&'a str>,
}

/// A registered hook.
pub trait Hook: Send + Sync {
    fn call(&self, point: HookPoint, cx: &HookContext<'_>) -> HookVerdict;
}

impl<F> Hook for F
where
    F: Fn(HookPoint, &HookContext<'_>) -> HookVerdict + Send + Sync,
{
    fn call(&self, point: HookPoint, cx: &HookContext<'_>) -> HookVerdict {
        self(point, cx)
    }
}

/// Aggregated result of dispatching one point.
#[derive(Debug, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub verdict: ControlVerdict,
    /// Text collected from `ModifyContext` verdicts, in registration order.
    pub injected: Vec<String>,
}

/// The control-flow part of a dispatch: modifications are accumulated
/// separately and never stop the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlVerdict {
    Continue,
    Pause,
    Abort,
    RestartStage,
}

impl DispatchOutcome {
    pub fn continues(&self) -> bool {
        self.verdict == ControlVerdict::Continue
    }
}

/// Ordered hook registry.
#[derive(Default)]
pub struct HookDispatcher {
    hooks: Vec<(HookPoint, Box<dyn Hook>)>,
    strict: bool,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// In strict mode a panicking hook aborts the run instead of being
    /// skipped.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn register(&mut self, point: HookPoint, hook: Box<dyn Hook>) {
        self.hooks.push((point, hook));
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook registered for `point`, in registration order.
    /// The first non-continue control verdict short-circuits; `ModifyContext`
    /// verdicts accumulate and keep going.
    pub fn dispatch(&self, point: HookPoint, cx: &HookContext<'_>) -> DispatchOutcome {
        let mut injected = Vec::new();
        for (registered_point, hook) in &self.hooks {
            if *registered_point != point {
                continue;
            }
            let verdict =
                match std::panic::catch_unwind(AssertUnwindSafe(|| hook.call(point, cx))) {
                    Ok(verdict) => verdict,
                    Err(_) => {
                        error!(point = %point, session = cx.session, "hook panicked");
                        if self.strict {
                            return DispatchOutcome {
                                verdict: ControlVerdict::Abort,
                                injected,
                            };
                        }
                        continue;
                    }
                };
            match verdict {
                HookVerdict::Continue => {}
                HookVerdict::ModifyContext(text) => injected.push(text),
                HookVerdict::Pause => {
                    return DispatchOutcome {
                        verdict: ControlVerdict::Pause,
                        injected,
                    };
                }
                HookVerdict::Abort => {
                    return DispatchOutcome {
                        verdict: ControlVerdict::Abort,
                        injected,
                    };
                }
                HookVerdict::RestartStage => {
                    return DispatchOutcome {
                        verdict: ControlVerdict::RestartStage,
                        injected,
                    };
                }
            }
        }
        DispatchOutcome {
            verdict: ControlVerdict::Continue,
            injected,
        }
    }
}

impl std::fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDispatcher")
            .field("hooks", &self.hooks.len())
            .field("strict", &self.strict)
            .finish()
    }
}
