//! Session lifecycle orchestration.
//!
//! The engine compiles the plan, takes the session lock, initializes or
//! reconciles state, then walks the plan nodes: stage nodes through the
//! iteration driver, parallel nodes through the coordinator. It owns
//! signal-driven graceful shutdown and guarantees the lock is released on
//! every exit path. Engines are plain values: several may coexist in one
//! process, each with its own registry and hooks.

use anyhow::{Context, Result, bail};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::driver::{IterationDriver, StageEnd, StageFailure, StageRun, node_key};
use crate::errors::ErrorKind;
use crate::events::{Cursor, Event, EventLog, EventType};
use crate::hooks::{ControlVerdict, Hook, HookContext, HookDispatcher, HookPoint};
use crate::lock::LockManager;
use crate::parallel::ParallelCoordinator;
use crate::pipeline::{Node, Overrides, PipelineDef, Plan, load_or_compile};
use crate::provider::{DEFAULT_PROVIDER_TIMEOUT, Provider, ProviderRegistry};
use crate::reconcile::reconcile;
use crate::session::SessionPaths;
use crate::state::{SessionStatus, StateStore};

/// Where the engine reads and writes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub runs_root: PathBuf,
    pub locks_root: PathBuf,
    pub project_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub provider_timeout: Duration,
    pub strict_hooks: bool,
}

impl EngineConfig {
    pub fn new(runs_root: impl Into<PathBuf>, locks_root: impl Into<PathBuf>) -> Self {
        Self {
            runs_root: runs_root.into(),
            locks_root: locks_root.into(),
            project_dir: PathBuf::from("."),
            templates_dir: PathBuf::from("."),
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            strict_hooks: false,
        }
    }
}

/// One session execution request.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session: String,
    /// "loop" or "pipeline".
    pub kind: String,
    pub def: PipelineDef,
    pub source: PathBuf,
    pub source_text: String,
    pub overrides: Overrides,
    pub force: bool,
    pub resume: bool,
    pub recompile: bool,
}

/// How a run ended, for exit-code mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    Completed,
    Paused,
    Aborted,
}

/// The engine. Constructable; no global state.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<ProviderRegistry>,
    hooks: Arc<HookDispatcher>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let hooks = HookDispatcher::new().strict(config.strict_hooks);
        Self {
            config,
            registry: Arc::new(ProviderRegistry::with_builtins()),
            hooks: Arc::new(hooks),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the registry wholesale (mock providers in tests).
    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Install a pre-built hook dispatcher.
    pub fn with_hooks(mut self, hooks: HookDispatcher) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn register_hook(&mut self, point: HookPoint, hook: Box<dyn Hook>) {
        match Arc::get_mut(&mut self.hooks) {
            Some(hooks) => hooks.register(point, hook),
            None => warn!("cannot register hooks while a run is active"),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// First SIGINT/SIGTERM starts graceful shutdown; a second within five
    /// seconds force-exits. Call once from the CLI before `run`.
    pub fn spawn_signal_handler(&self) -> tokio::task::JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
                return;
            };
            let Ok(mut terminate) = signal(SignalKind::terminate()) else {
                return;
            };
            let mut first: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                }
                match first {
                    Some(at) if at.elapsed() < Duration::from_secs(5) => {
                        warn!("second signal; forcing exit");
                        std::process::exit(130);
                    }
                    _ => {
                        info!("shutdown requested; finishing current iteration");
                        cancel.cancel();
                        first = Some(Instant::now());
                    }
                }
            }
        })
    }

    /// Execute a session to completion, pause, or failure. The lock is
    /// released on every path out of here (guard drop).
    pub async fn run(&self, request: RunRequest) -> Result<RunEnd> {
        let paths = SessionPaths::new(
            &self.config.runs_root,
            &self.config.locks_root,
            &request.session,
        )?;
        std::fs::create_dir_all(paths.session_dir())
            .with_context(|| format!("failed to create {}", paths.session_dir().display()))?;

        let plan = load_or_compile(
            &paths.plan_path(),
            &request.def,
            &request.kind,
            &request.source,
            &request.source_text,
            &request.overrides,
            request.recompile,
        )?;

        let locks = LockManager::new(&self.config.locks_root);
        let guard = locks.acquire(&request.session, request.force)?;

        let events = EventLog::new(paths.events_path());
        let store = StateStore::new(paths.state_path());
        let resumed = self.prepare_state(&request, &plan, &events, &store)?;

        if let Err(e) = self.init_providers(&plan).await {
            let kind = e
                .downcast_ref::<crate::errors::ProviderError>()
                .map(|p| p.kind())
                .unwrap_or(ErrorKind::ProviderMissing);
            store.mark_failed(kind, &e.to_string())?;
            guard.release();
            return Err(e);
        }

        let driver = IterationDriver::new(
            plan.clone(),
            paths.clone(),
            self.config.project_dir.clone(),
            self.config.templates_dir.clone(),
            self.registry.clone(),
            self.hooks.clone(),
            self.cancel.clone(),
            store.load()?.started_at,
            self.config.provider_timeout,
        );

        if resumed {
            events.append(&Event::new(EventType::SessionResumed, &request.session))?;
        } else {
            events.append(
                &Event::new(EventType::SessionStart, &request.session)
                    .with_data(json!({"pipeline": plan.pipeline, "kind": plan.kind})),
            )?;
        }
        let state = store.load()?;
        let outcome = self.hooks.dispatch(
            HookPoint::SessionStart,
            &HookContext {
                session: &request.session,
                stage: None,
                iteration: None,
                provider: None,
                state: &state,
                last_report: None,
                progress: None,
            },
        );
        if outcome.verdict == ControlVerdict::Abort {
            self.finish_aborted(&store, &events, &request.session, "aborted by session hook")?;
            guard.release();
            return Ok(RunEnd::Aborted);
        }

        let end = self.drive_nodes(&plan, &driver, &store, &events, &request).await;

        let run_end = match end {
            Ok(run_end) => run_end,
            Err(e) => {
                // Make sure the failure is on disk before the lock drops.
                let state = store.load()?;
                if state.status.can_transition(SessionStatus::Failed) {
                    let kind = e
                        .downcast_ref::<StageFailure>()
                        .map(|f| f.kind)
                        .or_else(|| {
                            e.downcast_ref::<crate::errors::ProviderError>()
                                .map(|p| p.kind())
                        })
                        .unwrap_or(ErrorKind::StateCorrupt);
                    store.mark_failed(kind, &e.to_string())?;
                }
                self.shutdown_providers(&plan).await;
                guard.release();
                return Err(e);
            }
        };

        match run_end {
            RunEnd::Completed => {
                store.mark_completed()?;
                events.append(&Event::new(EventType::SessionComplete, &request.session))?;
                let count = events.count()? as u64;
                store.update(|s| s.events_processed = count)?;
                let state = store.load()?;
                self.hooks.dispatch(
                    HookPoint::SessionEnd,
                    &HookContext {
                        session: &request.session,
                        stage: None,
                        iteration: None,
                        provider: None,
                        state: &state,
                        last_report: None,
                        progress: None,
                    },
                );
            }
            RunEnd::Paused => {
                store.mark_paused()?;
                events.append(&Event::new(EventType::SessionPaused, &request.session))?;
                let count = events.count()? as u64;
                store.update(|s| s.events_processed = count)?;
            }
            RunEnd::Aborted => {
                self.finish_aborted(&store, &events, &request.session, "aborted by hook")?;
            }
        }

        self.shutdown_providers(&plan).await;
        guard.release();
        Ok(run_end)
    }

    /// Initialize or load session state, reconciling from events when the
    /// snapshot is missing, stale, or marks a crashed iteration.
    fn prepare_state(
        &self,
        request: &RunRequest,
        plan: &Plan,
        events: &EventLog,
        store: &StateStore,
    ) -> Result<bool> {
        let event_count = events.count()? as u64;

        if !store.exists() {
            if event_count > 0 {
                // State lost but events survive: rebuild.
                let state = reconcile(&request.session, &plan.kind, &plan.pipeline, &events.read()?);
                store.write(&state)?;
            } else {
                store.init(&request.session, &plan.kind, &plan.pipeline)?;
                return Ok(false);
            }
        }

        let mut state = store.load().map_err(|e| {
            anyhow::anyhow!(
                "{e:#}; state is unreadable, move it aside or delete the session to rebuild from events"
            )
        })?;

        let crashed = state.has_incomplete_iteration();
        let stale = event_count > state.events_processed;
        if crashed || stale {
            info!(
                session = %request.session,
                crashed,
                stale,
                "reconciling state from event log"
            );
            state = reconcile(&request.session, &plan.kind, &plan.pipeline, &events.read()?);
            store.write(&state)?;
        }

        match state.status {
            SessionStatus::Completed => {
                bail!(
                    "session '{}' already completed; use a new session name",
                    request.session
                )
            }
            SessionStatus::Aborted => {
                bail!("session '{}' was aborted and cannot resume", request.session)
            }
            SessionStatus::Paused | SessionStatus::Failed => {
                if !request.resume {
                    bail!(
                        "session '{}' is {}; pass --resume to continue it",
                        request.session,
                        state.status
                    );
                }
                store.mark_resumed()?;
                Ok(true)
            }
            SessionStatus::Pending | SessionStatus::Running => Ok(crashed || stale),
        }
    }

    async fn drive_nodes(
        &self,
        plan: &Plan,
        driver: &IterationDriver,
        store: &StateStore,
        events: &EventLog,
        request: &RunRequest,
    ) -> Result<RunEnd> {
        for pass in 0..plan.runs.max(1) {
            for node in &plan.nodes {
                for repeat in 0..node.runs().max(1) {
                    let node_run = pass * node.runs().max(1) + repeat;
                    let key = node_key(node.path(), node_run);
                    if store.load()?.completed_stages.contains(&key) {
                        continue;
                    }
                    if self.cancel.is_cancelled() {
                        bail!(StageFailure::new(
                            ErrorKind::SignalInterrupt,
                            "shutdown requested",
                        ));
                    }

                    let state = store.load()?;
                    let outcome = self.hooks.dispatch(
                        HookPoint::StageStart,
                        &HookContext {
                            session: &request.session,
                            stage: Some(node.id()),
                            iteration: None,
                            provider: None,
                            state: &state,
                            last_report: None,
                            progress: None,
                        },
                    );
                    match outcome.verdict {
                        ControlVerdict::Continue | ControlVerdict::RestartStage => {}
                        ControlVerdict::Pause => return Ok(RunEnd::Paused),
                        ControlVerdict::Abort => return Ok(RunEnd::Aborted),
                    }

                    // Resuming into a node that already started must not
                    // emit a second node_start: reconciliation treats it
                    // as a fresh stage instance.
                    if state.current_stage.as_deref() != Some(key.as_str()) {
                        events.append(
                            &Event::new(EventType::NodeStart, &request.session)
                                .with_cursor(Cursor::new(node.path(), node_run, 0))
                                .with_data(json!({"id": node.id()})),
                        )?;
                    }

                    match node {
                        Node::Stage(stage) => {
                            let run = StageRun {
                                stage,
                                node_path: stage.path.clone(),
                                node_run,
                                scope_root: None,
                                provider_cursor: None,
                            };
                            let outcome = driver.run_stage(&run, store).await?;
                            match outcome.end {
                                StageEnd::Paused => return Ok(RunEnd::Paused),
                                StageEnd::Aborted => return Ok(RunEnd::Aborted),
                                StageEnd::Stopped { .. } | StageEnd::Exhausted => {}
                            }
                        }
                        Node::Parallel(parallel) => {
                            let coordinator = ParallelCoordinator::new(driver);
                            coordinator.run(parallel, node_run, store).await?;
                        }
                    }

                    events.append(
                        &Event::new(EventType::NodeComplete, &request.session)
                            .with_cursor(Cursor::new(node.path(), node_run, 0))
                            .with_data(json!({"id": node.id()})),
                    )?;
                    store.update(|s| {
                        if !s.completed_stages.contains(&key) {
                            s.completed_stages.push(key.clone());
                        }
                    })?;

                    let state = store.load()?;
                    let outcome = self.hooks.dispatch(
                        HookPoint::StageEnd,
                        &HookContext {
                            session: &request.session,
                            stage: Some(node.id()),
                            iteration: None,
                            provider: None,
                            state: &state,
                            last_report: None,
                            progress: None,
                        },
                    );
                    match outcome.verdict {
                        ControlVerdict::Continue | ControlVerdict::RestartStage => {}
                        ControlVerdict::Pause => return Ok(RunEnd::Paused),
                        ControlVerdict::Abort => return Ok(RunEnd::Aborted),
                    }
                }
            }
        }
        Ok(RunEnd::Completed)
    }

    /// Abort goes through paused: the state machine has no direct
    /// running -> aborted edge.
    fn finish_aborted(
        &self,
        store: &StateStore,
        events: &EventLog,
        session: &str,
        message: &str,
    ) -> Result<()> {
        let state = store.load()?;
        if state.status == SessionStatus::Running {
            store.mark_paused()?;
        }
        store.transition(SessionStatus::Aborted)?;
        events.append(
            &Event::new(EventType::Error, session).with_data(json!({"message": message})),
        )?;
        Ok(())
    }

    fn plan_providers(&self, plan: &Plan) -> Vec<Arc<dyn Provider>> {
        let mut names: Vec<&str> = Vec::new();
        for node in &plan.nodes {
            match node {
                Node::Stage(stage) => names.push(&stage.provider),
                Node::Parallel(parallel) => {
                    names.extend(parallel.providers.iter().map(String::as_str))
                }
            }
        }
        names.sort_unstable();
        names.dedup();
        names
            .into_iter()
            .filter_map(|name| self.registry.resolve(name).ok())
            .collect()
    }

    async fn init_providers(&self, plan: &Plan) -> Result<()> {
        for node in &plan.nodes {
            match node {
                Node::Stage(stage) => {
                    self.registry.resolve(&stage.provider)?;
                }
                Node::Parallel(parallel) => {
                    for provider in &parallel.providers {
                        self.registry.resolve(provider)?;
                    }
                }
            }
        }
        for provider in self.plan_providers(plan) {
            provider.init().await?;
        }
        Ok(())
    }

    async fn shutdown_providers(&self, plan: &Plan) {
        for provider in self.plan_providers(plan) {
            if let Err(e) = provider.shutdown().await {
                warn!(provider = provider.name(), error = %e, "provider shutdown failed");
            }
        }
    }
}
