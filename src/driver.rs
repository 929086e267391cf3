//! The iteration driver: the engine's core loop.
//!
//! One stage instance runs here: per-iteration context generation, prompt
//! rendering, provider invocation, result validation, history recording,
//! event emission, and the termination decision. Retryable failures retry
//! at the same iteration index with exponential backoff before promoting
//! to fatal.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{ContextBuilder, ContextManifest, ParallelScope};
use crate::errors::ErrorKind;
use crate::events::{Cursor, Event, EventLog, EventType};
use crate::hooks::{ControlVerdict, HookContext, HookDispatcher, HookPoint};
use crate::pipeline::{Plan, StageNode};
use crate::provider::{Provider, ProviderRegistry, ProviderRequest};
use crate::report::{AgentReport, LoadedReport, load_report};
use crate::session::{SessionPaths, StagePaths};
use crate::state::{IterationRecord, StateStore};
use crate::template::{TemplateVars, resolve};
use crate::termination::{PolicyContext, TerminationDecision, build_policy};

/// Base backoff for retryable iteration errors.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// A stage-fatal failure with its wire classification.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// How a stage instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEnd {
    /// The termination policy said stop.
    Stopped { reason: String },
    /// The iteration cap ran out before the policy stopped.
    Exhausted,
    /// A hook paused the session.
    Paused,
    /// A hook aborted the session.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub end: StageEnd,
    pub iterations_completed: u32,
}

/// Parameters for one stage instance.
pub struct StageRun<'a> {
    pub stage: &'a StageNode,
    pub node_path: String,
    pub node_run: u32,
    /// Set inside a parallel worker: the provider's isolated sub-root.
    pub scope_root: Option<PathBuf>,
    /// Provider tag for event cursors inside a parallel block.
    pub provider_cursor: Option<String>,
}

impl StageRun<'_> {
    /// Identity of this stage instance in state: repeats of a node are
    /// distinct instances with fresh iteration counters.
    pub fn node_key(&self) -> String {
        node_key(&self.node_path, self.node_run)
    }
}

/// Shared key format for `current_stage` / `completed_stages` entries.
pub fn node_key(node_path: &str, node_run: u32) -> String {
    format!("{}#{}", node_path, node_run)
}

struct DriverInner {
    plan: Plan,
    session: SessionPaths,
    project_dir: PathBuf,
    templates_dir: PathBuf,
    events: EventLog,
    registry: Arc<ProviderRegistry>,
    hooks: Arc<HookDispatcher>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    deadline: Option<Instant>,
    provider_timeout: Duration,
}

/// Drives iterations for stages, shared between the engine's sequential
/// path and parallel workers.
#[derive(Clone)]
pub struct IterationDriver {
    inner: Arc<DriverInner>,
}

impl IterationDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan: Plan,
        session: SessionPaths,
        project_dir: PathBuf,
        templates_dir: PathBuf,
        registry: Arc<ProviderRegistry>,
        hooks: Arc<HookDispatcher>,
        cancel: CancellationToken,
        started_at: DateTime<Utc>,
        provider_timeout: Duration,
    ) -> Self {
        let deadline = plan
            .max_runtime_seconds
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let events = EventLog::new(session.events_path());
        Self {
            inner: Arc::new(DriverInner {
                plan,
                session,
                project_dir,
                templates_dir,
                events,
                registry,
                hooks,
                cancel,
                started_at,
                deadline,
                provider_timeout,
            }),
        }
    }

    pub fn session_name(&self) -> &str {
        self.inner.session.session()
    }

    pub fn session_dir(&self) -> &Path {
        self.inner.session.session_dir()
    }

    pub fn plan(&self) -> &Plan {
        &self.inner.plan
    }

    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn emit(&self, event: Event) -> Result<()> {
        self.inner.events.append(&event)
    }

    fn cursor(&self, run: &StageRun<'_>, iteration: u32) -> Cursor {
        let cursor = Cursor::new(run.node_path.clone(), run.node_run, iteration);
        match &run.provider_cursor {
            Some(provider) => cursor.with_provider(provider.clone()),
            None => cursor,
        }
    }

    /// Run one stage instance to its end. `store` is the session store for
    /// sequential stages and the provider-scoped store inside parallel
    /// workers.
    pub async fn run_stage(&self, run: &StageRun<'_>, store: &StateStore) -> Result<StageOutcome> {
        let inner = &self.inner;
        let stage = run.stage;
        let root = run
            .scope_root
            .clone()
            .unwrap_or_else(|| inner.session.session_dir().to_path_buf());
        let stage_paths = StagePaths::new(&root, stage.index, &stage.id)?;
        std::fs::create_dir_all(stage_paths.dir())
            .with_context(|| format!("failed to create {}", stage_paths.dir().display()))?;

        // Entering a different stage resets per-stage progress; re-entering
        // the same one (resume) keeps it.
        let node_key = run.node_key();
        let state = store.load()?;
        if state.current_stage.as_deref() != Some(node_key.as_str()) {
            store.update(|s| s.enter_stage(&node_key))?;
        }

        let scope = run.scope_root.as_ref().map(|scope_root| ParallelScope {
            scope_root: scope_root.clone(),
            pipeline_root: inner.session.session_dir().to_path_buf(),
        });

        let mut policy = build_policy(&stage.termination);
        let mut injected: Vec<String> = Vec::new();
        let mut iteration = store.load()?.resume_from();

        while iteration <= stage.max_iterations {
            if inner.cancel.is_cancelled() {
                bail!(StageFailure::new(
                    ErrorKind::SignalInterrupt,
                    "shutdown requested",
                ));
            }

            store.mark_iteration_started(iteration)?;
            self.emit(
                Event::new(EventType::IterationStart, self.session_name())
                    .with_cursor(self.cursor(run, iteration)),
            )?;

            let builder = ContextBuilder::new(
                &inner.plan,
                &inner.session,
                &inner.project_dir,
                scope.clone(),
                inner.started_at,
            );
            let manifest = builder.build(stage, &stage_paths, iteration)?;
            manifest.write(&stage_paths.context_path(iteration))?;

            let mut prompt = self.render_prompt(run, &stage_paths, &manifest, iteration)?;

            // iteration_start hook: may pause, abort, or inject context.
            let state = store.load()?;
            let outcome = inner.hooks.dispatch(
                HookPoint::IterationStart,
                &HookContext {
                    session: self.session_name(),
                    stage: Some(&stage.id),
                    iteration: Some(iteration),
                    provider: run.provider_cursor.as_deref(),
                    state: &state,
                    last_report: None,
                    progress: None,
                },
            );
            injected.extend(outcome.injected.iter().cloned());
            match outcome.verdict {
                ControlVerdict::Continue => {}
                ControlVerdict::Pause => {
                    return Ok(StageOutcome {
                        end: StageEnd::Paused,
                        iterations_completed: state.iteration_completed,
                    });
                }
                ControlVerdict::Abort => {
                    return Ok(StageOutcome {
                        end: StageEnd::Aborted,
                        iterations_completed: state.iteration_completed,
                    });
                }
                ControlVerdict::RestartStage => {
                    store.update(|s| s.enter_stage(&node_key))?;
                    iteration = 1;
                    injected.clear();
                    continue;
                }
            }
            if !injected.is_empty() {
                prompt.push_str("\n\n## ADDITIONAL CONTEXT\n");
                prompt.push_str(&injected.join("\n\n"));
                injected.clear();
            }

            let report = self
                .invoke_with_retries(run, &stage_paths, iteration, &prompt)
                .await;
            let report = match report {
                Ok(report) => report,
                Err(failure) => {
                    // The failed iteration still leaves a history entry,
                    // built from a synthesized error report.
                    let synthesized =
                        AgentReport::synthesized_error(failure.kind, failure.message.clone());
                    store.record_iteration(IterationRecord::from_report(
                        iteration,
                        &synthesized,
                    ))?;
                    self.record_failure(store, &stage_paths, iteration, &failure, run)?;
                    bail!(failure);
                }
            };

            let record = IterationRecord::from_report(iteration, &report);
            store.record_iteration(record.clone())?;
            write_status_mirror(&stage_paths, iteration, &report)?;

            self.emit(
                Event::new(EventType::IterationComplete, self.session_name())
                    .with_cursor(self.cursor(run, iteration))
                    .with_data(json!({"record": record})),
            )?;

            // iteration_end hook.
            let state = store.load()?;
            let progress = read_progress(&stage_paths);
            let outcome = inner.hooks.dispatch(
                HookPoint::IterationEnd,
                &HookContext {
                    session: self.session_name(),
                    stage: Some(&stage.id),
                    iteration: Some(iteration),
                    provider: run.provider_cursor.as_deref(),
                    state: &state,
                    last_report: Some(&report),
                    progress: progress.as_deref(),
                },
            );
            injected.extend(outcome.injected.iter().cloned());

            store.mark_iteration_completed(iteration)?;

            match outcome.verdict {
                ControlVerdict::Continue => {}
                ControlVerdict::Pause => {
                    return Ok(StageOutcome {
                        end: StageEnd::Paused,
                        iterations_completed: iteration,
                    });
                }
                ControlVerdict::Abort => {
                    return Ok(StageOutcome {
                        end: StageEnd::Aborted,
                        iterations_completed: iteration,
                    });
                }
                ControlVerdict::RestartStage => {
                    store.update(|s| s.enter_stage(&node_key))?;
                    iteration = 1;
                    injected.clear();
                    continue;
                }
            }

            // An error decision terminates the stage immediately.
            if report.is_error() {
                let kind = report.error_type.unwrap_or(ErrorKind::ProviderCrashed);
                let failure = StageFailure::new(
                    kind,
                    report
                        .summary
                        .clone()
                        .unwrap_or_else(|| "agent reported an error".into()),
                );
                self.record_failure(store, &stage_paths, iteration, &failure, run)?;
                bail!(failure);
            }

            let state = store.load()?;
            let decision = {
                let cx = PolicyContext {
                    session: self.session_name(),
                    state: &state,
                    stage,
                    stage_paths: &stage_paths,
                    iteration,
                    cursor: self.cursor(run, iteration),
                    events: &inner.events,
                    registry: &inner.registry,
                    cancel: &inner.cancel,
                    templates_dir: &inner.templates_dir,
                    work_dir: &inner.project_dir,
                };
                policy.decide(&cx).await?
            };
            if let TerminationDecision::Stop { reason } = decision {
                debug!(stage = %stage.id, iteration, %reason, "stage terminated");
                return Ok(StageOutcome {
                    end: StageEnd::Stopped { reason },
                    iterations_completed: iteration,
                });
            }

            iteration += 1;
            if iteration <= stage.max_iterations && stage.delay_seconds > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(stage.delay_seconds)) => {}
                    _ = inner.cancel.cancelled() => {}
                }
            }
        }

        Ok(StageOutcome {
            end: StageEnd::Exhausted,
            iterations_completed: stage.max_iterations,
        })
    }

    /// Invoke the provider, retrying retryable failures at the same
    /// iteration index with exponential backoff.
    async fn invoke_with_retries(
        &self,
        run: &StageRun<'_>,
        stage_paths: &StagePaths,
        iteration: u32,
        prompt: &str,
    ) -> Result<AgentReport, StageFailure> {
        let inner = &self.inner;
        let stage = run.stage;
        let provider = inner.registry.resolve(&stage.provider).map_err(|e| {
            StageFailure::new(e.kind(), e.to_string())
        })?;

        let mut attempt: u32 = 0;
        loop {
            let failure_kind = match self
                .invoke_once(provider.as_ref(), run, stage_paths, iteration, prompt)
                .await
            {
                Ok(report) => return Ok(report),
                Err(failure) => {
                    if attempt >= failure.kind.max_retries() {
                        return Err(failure);
                    }
                    warn!(
                        stage = %stage.id,
                        iteration,
                        attempt = attempt + 1,
                        kind = %failure.kind,
                        "retrying iteration: {}",
                        failure.message
                    );
                    failure.kind
                }
            };

            let backoff = RETRY_BACKOFF * 2u32.pow(attempt);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = inner.cancel.cancelled() => {
                    return Err(StageFailure::new(
                        ErrorKind::SignalInterrupt,
                        format!("shutdown during {} retry", failure_kind),
                    ));
                }
            }
            attempt += 1;
        }
    }

    async fn invoke_once(
        &self,
        provider: &dyn Provider,
        run: &StageRun<'_>,
        stage_paths: &StagePaths,
        iteration: u32,
        prompt: &str,
    ) -> Result<AgentReport, StageFailure> {
        let inner = &self.inner;
        let stage = run.stage;

        let mut request = ProviderRequest::new(prompt, &inner.project_dir);
        request.model = stage.model.clone();
        request.timeout = inner.provider_timeout;
        request.deadline = inner.deadline;
        request.env = vec![
            (
                "CONDUCTOR_CONTEXT".into(),
                stage_paths
                    .context_path(iteration)
                    .to_string_lossy()
                    .into_owned(),
            ),
            ("CONDUCTOR_SESSION".into(), self.session_name().to_string()),
            (
                "CONDUCTOR_RESULT".into(),
                stage_paths
                    .result_path(iteration)
                    .to_string_lossy()
                    .into_owned(),
            ),
        ];

        provider
            .validate(&request)
            .map_err(|e| StageFailure::new(e.kind(), e.to_string()))?;

        let outcome = provider
            .execute(&inner.cancel, request)
            .await
            .map_err(|e| StageFailure::new(e.kind(), e.to_string()))?;

        // Captured output is kept even for failed invocations.
        let output_path = stage_paths.iteration_output_path(iteration);
        if let Some(parent) = output_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(&output_path, &outcome.output).map_err(|e| {
            StageFailure::new(
                ErrorKind::StateCorrupt,
                format!("failed to write iteration output: {}", e),
            )
        })?;
        // Stable stage-level mirror of the latest output.
        let _ = std::fs::write(stage_paths.output_path(), &outcome.output);

        if !outcome.succeeded() {
            return Err(StageFailure::new(
                ErrorKind::ProviderCrashed,
                format!(
                    "provider '{}' exited with code {}",
                    stage.provider, outcome.exit_code
                ),
            ));
        }

        match load_report(&stage_paths.result_path(iteration)).map_err(|e| {
            StageFailure::new(ErrorKind::ResultInvalid, e.to_string())
        })? {
            LoadedReport::Valid(report) => Ok(report),
            LoadedReport::Missing => Err(StageFailure::new(
                ErrorKind::ResultMissing,
                format!(
                    "agent produced no result.json for iteration {}",
                    iteration
                ),
            )),
            LoadedReport::Invalid { message, raw } => {
                // Retain the raw text next to the error for debugging.
                let _ = std::fs::write(
                    stage_paths.error_path(iteration),
                    serde_json::to_string_pretty(&json!({
                        "error_type": ErrorKind::ResultInvalid,
                        "message": message,
                        "raw": raw,
                    }))
                    .unwrap_or_default(),
                );
                Err(StageFailure::new(
                    ErrorKind::ResultInvalid,
                    format!("result.json is invalid: {}", message),
                ))
            }
        }
    }

    /// Persist the failure trail: `error.json`, an error event, and the
    /// failed status on the store.
    fn record_failure(
        &self,
        store: &StateStore,
        stage_paths: &StagePaths,
        iteration: u32,
        failure: &StageFailure,
        run: &StageRun<'_>,
    ) -> Result<()> {
        let error_path = stage_paths.error_path(iteration);
        if let Some(parent) = error_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if !error_path.exists() {
            let _ = std::fs::write(
                &error_path,
                serde_json::to_string_pretty(&json!({
                    "error_type": failure.kind,
                    "message": failure.message,
                    "iteration": iteration,
                }))
                .unwrap_or_default(),
            );
        }
        self.emit(
            Event::new(EventType::Error, self.session_name())
                .with_cursor(self.cursor(run, iteration))
                .with_data(json!({
                    "message": failure.message,
                    "error_type": failure.kind,
                })),
        )?;
        store.mark_failed(failure.kind, &failure.message)?;
        Ok(())
    }

    fn render_prompt(
        &self,
        run: &StageRun<'_>,
        stage_paths: &StagePaths,
        manifest: &ContextManifest,
        iteration: u32,
    ) -> Result<String> {
        let stage = run.stage;
        let text = match (&stage.template, &stage.prompt) {
            (Some(template), _) => {
                let path = crate::session::guard_within(
                    &self.inner.templates_dir,
                    Path::new(&format!("{}.md", template)),
                )?;
                std::fs::read_to_string(&path).with_context(|| {
                    format!("failed to read template {}", path.display())
                })?
            }
            (None, Some(prompt)) => prompt.clone(),
            (None, None) => {
                return Err(anyhow!(
                    "stage '{}' has neither a template nor a prompt",
                    stage.id
                ));
            }
        };

        let mut vars = TemplateVars::new();
        vars.set(
            "CTX",
            stage_paths
                .context_path(iteration)
                .to_string_lossy()
                .into_owned(),
        );
        vars.set("STATUS", manifest.paths.status.clone())
            .set("RESULT", manifest.paths.result.clone())
            .set("PROGRESS", manifest.paths.progress.clone())
            .set("OUTPUT", manifest.paths.output.clone())
            .set("OUTPUT_PATH", manifest.paths.output.clone())
            .set("SESSION", self.session_name())
            .set("ITERATION", iteration.to_string())
            .set("INDEX", stage.index.to_string())
            .set(
                "PERSPECTIVE",
                run.provider_cursor.clone().unwrap_or_default(),
            )
            .set(
                "CONTEXT",
                self.inner.plan.context.clone().unwrap_or_default(),
            );
        Ok(resolve(&text, &vars))
    }
}

fn write_status_mirror(
    stage_paths: &StagePaths,
    iteration: u32,
    report: &AgentReport,
) -> Result<()> {
    let body = serde_json::to_string_pretty(&json!({
        "decision": report.decision,
        "summary": report.summary,
    }))
    .context("failed to serialize status mirror")?;
    std::fs::write(stage_paths.status_path(iteration), body)
        .context("failed to write status.json")?;
    Ok(())
}

fn read_progress(stage_paths: &StagePaths) -> Option<String> {
    std::fs::read_to_string(stage_paths.progress_path()).ok()
}
