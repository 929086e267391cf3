//! End-to-end engine tests with a scripted mock provider.
//!
//! These exercise the whole execution path: plan compilation, locking,
//! state, events, iteration driving, termination, parallel fan-out, and
//! crash recovery. No real agent binaries are spawned.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use conductor::engine::{Engine, EngineConfig, RunEnd, RunRequest};
use conductor::errors::{ErrorKind, ProviderError};
use conductor::events::{Cursor, Event, EventLog, EventType};
use conductor::lock::LockManager;
use conductor::parallel::MergeManifest;
use conductor::pipeline::{Overrides, PipelineDef};
use conductor::provider::{
    Capabilities, Provider, ProviderOutcome, ProviderRegistry, ProviderRequest,
};
use conductor::state::{SessionStatus, StateStore};

/// Scripted provider: each invocation writes the next decision into the
/// result file named by the request env, then returns the configured exit
/// code. When the script runs dry it repeats the last decision.
#[derive(Debug)]
struct MockProvider {
    name: String,
    decisions: Mutex<VecDeque<String>>,
    exit_code: i32,
    write_result: bool,
    output: Option<String>,
}

impl MockProvider {
    fn scripted(name: &str, decisions: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            decisions: Mutex::new(decisions.iter().map(|d| d.to_string()).collect()),
            exit_code: 0,
            write_result: true,
            output: None,
        })
    }

    fn crashing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            decisions: Mutex::new(VecDeque::new()),
            exit_code: 2,
            write_result: false,
            output: None,
        })
    }

    fn silent(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            decisions: Mutex::new(VecDeque::new()),
            exit_code: 0,
            write_result: false,
            output: None,
        })
    }

    /// Emits fixed stdout and no result file, the shape of a judge.
    fn answering(name: &str, output: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            decisions: Mutex::new(VecDeque::new()),
            exit_code: 0,
            write_result: false,
            output: Some(output.to_string()),
        })
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            models: &[],
            effort_suffixes: false,
        }
    }

    fn validate(&self, _request: &ProviderRequest) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        request: ProviderRequest,
    ) -> Result<ProviderOutcome, ProviderError> {
        if self.write_result && self.exit_code == 0 {
            let result_path = request
                .env
                .iter()
                .find(|(key, _)| key == "CONDUCTOR_RESULT")
                .map(|(_, value)| PathBuf::from(value))
                .expect("request env names the result path");
            let decision = {
                let mut decisions = self.decisions.lock().unwrap();
                match decisions.len() {
                    0 => "continue".to_string(),
                    1 => decisions.front().cloned().unwrap(),
                    _ => decisions.pop_front().unwrap(),
                }
            };
            if let Some(parent) = result_path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(
                &result_path,
                json!({"decision": decision, "summary": format!("mock {}", decision)})
                    .to_string(),
            )
            .unwrap();
        }
        Ok(ProviderOutcome {
            output: self
                .output
                .clone()
                .unwrap_or_else(|| format!("output from {}", self.name)),
            exit_code: self.exit_code,
            duration: Duration::from_millis(1),
            truncated: false,
        })
    }
}

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        Self { _dir: dir, root }
    }

    fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(self.root.join("runs"), self.root.join("locks"));
        config.project_dir = self.root.clone();
        config.templates_dir = self.root.join("templates");
        config
    }

    fn request(&self, session: &str, kind: &str, yaml: &str) -> RunRequest {
        let def: PipelineDef = serde_yaml::from_str(yaml).unwrap();
        RunRequest {
            session: session.to_string(),
            kind: kind.to_string(),
            def,
            source: self.root.join("pipeline.yaml"),
            source_text: yaml.to_string(),
            overrides: Overrides::default(),
            force: false,
            resume: false,
            recompile: false,
        }
    }

    fn session_dir(&self, session: &str) -> PathBuf {
        self.root.join("runs").join(session)
    }

    fn events(&self, session: &str) -> Vec<Event> {
        EventLog::new(self.session_dir(session).join("events.jsonl"))
            .read()
            .unwrap()
    }

    fn state(&self, session: &str) -> conductor::state::SessionState {
        StateStore::new(self.session_dir(session).join("state.json"))
            .load()
            .unwrap()
    }
}

fn registry_with(providers: Vec<Arc<MockProvider>>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider).unwrap();
    }
    registry
}

fn count_events(events: &[Event], kind: EventType) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

// =============================================================================
// Scenario 1: fixed three-iteration stage
// =============================================================================

#[tokio::test]
async fn fixed_three_iteration_stage_completes() {
    let fixture = Fixture::new();
    let mock = MockProvider::scripted("mock", &["continue", "continue", "stop"]);
    let engine =
        Engine::new(fixture.engine_config()).with_registry(registry_with(vec![mock]));

    let yaml = r#"
name: fixed3
provider: mock
stages:
  - id: work
    prompt: "iterate"
    termination: { type: fixed, count: 3 }
"#;
    let end = engine
        .run(fixture.request("alpha", "loop", yaml))
        .await
        .unwrap();
    assert_eq!(end, RunEnd::Completed);

    let state = fixture.state("alpha");
    assert_eq!(state.status, SessionStatus::Completed);
    assert_eq!(state.iteration_completed, 3);

    let events = fixture.events("alpha");
    assert_eq!(count_events(&events, EventType::IterationComplete), 3);
    assert_eq!(count_events(&events, EventType::IterationStart), 3);
    assert_eq!(count_events(&events, EventType::SessionComplete), 1);

    // Iteration artifacts are on disk.
    let stage_dir = fixture.session_dir("alpha").join("stage-00-work");
    for iteration in ["001", "002", "003"] {
        let dir = stage_dir.join("iterations").join(iteration);
        assert!(dir.join("context.json").exists(), "{:?}", dir);
        assert!(dir.join("output.md").exists());
        assert!(dir.join("result.json").exists());
        assert!(dir.join("status.json").exists());
    }
}

// =============================================================================
// Scenario 2: consensus judgment
// =============================================================================

#[tokio::test]
async fn judgment_consensus_stops_after_window_is_unanimous() {
    let fixture = Fixture::new();
    let mock =
        MockProvider::scripted("mock", &["continue", "continue", "stop", "stop", "stop"]);
    let engine =
        Engine::new(fixture.engine_config()).with_registry(registry_with(vec![mock]));

    let yaml = r#"
name: consensus
provider: mock
stages:
  - id: refine
    prompt: "refine"
    max_iterations: 10
    termination: { type: judgment, min_iterations: 2, consensus: 2 }
"#;
    let end = engine
        .run(fixture.request("beta", "loop", yaml))
        .await
        .unwrap();
    assert_eq!(end, RunEnd::Completed);

    let state = fixture.state("beta");
    // Iteration 3 has only one stop in the window; iteration 4 closes it.
    assert_eq!(state.iteration_completed, 4);
    let events = fixture.events("beta");
    assert_eq!(count_events(&events, EventType::IterationComplete), 4);
}

// =============================================================================
// Scenario 3: crash mid-iteration, resume
// =============================================================================

#[tokio::test]
async fn crash_mid_iteration_resumes_without_rerunning_completed_work() {
    let fixture = Fixture::new();
    let session = "gamma";
    let session_dir = fixture.session_dir(session);
    std::fs::create_dir_all(&session_dir).unwrap();

    // Seed the artifacts of a run that died during iteration 3: two
    // completed iterations, a started third, and a snapshot that lags the
    // event log.
    let log = EventLog::new(session_dir.join("events.jsonl"));
    log.append(&Event::new(EventType::SessionStart, session))
        .unwrap();
    log.append(
        &Event::new(EventType::NodeStart, session).with_cursor(Cursor::new("0", 0, 0)),
    )
    .unwrap();
    for iteration in 1..=2u32 {
        log.append(
            &Event::new(EventType::IterationStart, session)
                .with_cursor(Cursor::new("0", 0, iteration)),
        )
        .unwrap();
        log.append(
            &Event::new(EventType::IterationComplete, session)
                .with_cursor(Cursor::new("0", 0, iteration))
                .with_data(json!({"record": {
                    "iteration": iteration,
                    "decision": "continue",
                    "timestamp": Utc::now().to_rfc3339(),
                }})),
        )
        .unwrap();
    }
    log.append(
        &Event::new(EventType::IterationStart, session).with_cursor(Cursor::new("0", 0, 3)),
    )
    .unwrap();

    let store = StateStore::new(session_dir.join("state.json"));
    let mut crashed = conductor::state::SessionState::new(session, "loop", "fixed5");
    crashed.current_stage = Some("0#0".into());
    crashed.iteration = 3;
    crashed.iteration_completed = 2;
    crashed.iteration_started = Some(Utc::now());
    crashed.events_processed = 3; // stale: the log has 7
    store.write(&crashed).unwrap();

    // Relaunch. Iterations 3..5 run; 1..2 must not re-run.
    let mock = MockProvider::scripted("mock", &["continue", "continue", "stop"]);
    let engine =
        Engine::new(fixture.engine_config()).with_registry(registry_with(vec![mock]));
    let yaml = r#"
name: fixed5
provider: mock
stages:
  - id: work
    prompt: "iterate"
    max_iterations: 5
    termination: { type: fixed, count: 5 }
"#;
    let end = engine
        .run(fixture.request(session, "loop", yaml))
        .await
        .unwrap();
    assert_eq!(end, RunEnd::Completed);

    let state = fixture.state(session);
    assert_eq!(state.status, SessionStatus::Completed);
    assert_eq!(state.iteration_completed, 5);

    // Across both runs: exactly five completions, and iteration 3 ran
    // exactly twice as a start (crashed once, re-run once).
    let events = fixture.events(session);
    assert_eq!(count_events(&events, EventType::IterationComplete), 5);
    let iter3_starts = events
        .iter()
        .filter(|e| {
            e.kind == EventType::IterationStart
                && e.cursor.as_ref().is_some_and(|c| c.iteration == 3)
        })
        .count();
    assert_eq!(iter3_starts, 2);
}

// =============================================================================
// Scenario 4: lock conflict
// =============================================================================

#[tokio::test]
async fn second_start_of_a_locked_session_fails_without_force() {
    let fixture = Fixture::new();
    std::fs::create_dir_all(fixture.root.join("locks")).unwrap();
    let locks = LockManager::new(fixture.root.join("locks"));
    let _held = locks.acquire("alpha", false).unwrap();

    let mock = MockProvider::scripted("mock", &["stop"]);
    let engine =
        Engine::new(fixture.engine_config()).with_registry(registry_with(vec![mock]));
    let yaml = r#"
name: locked
provider: mock
stages:
  - id: work
    prompt: "iterate"
    termination: { type: fixed, count: 1 }
"#;
    let err = engine
        .run(fixture.request("alpha", "loop", yaml))
        .await
        .unwrap_err();

    match err.downcast_ref::<conductor::errors::LockError>() {
        Some(conductor::errors::LockError::Held { session, pid }) => {
            assert_eq!(session, "alpha");
            assert_eq!(*pid, std::process::id());
        }
        other => panic!("expected Held, got {:?}", other),
    }
    // No state was created for the refused run.
    assert!(!fixture.session_dir("alpha").join("state.json").exists());
}

// =============================================================================
// Scenario 5: parallel merge
// =============================================================================

const PARALLEL_YAML: &str = r#"
name: par
stages:
  - id: impls
    parallel:
      providers: [p1, p2]
      stages:
        - id: implement
          prompt: "implement it"
          termination: { type: fixed, count: 1 }
"#;

#[tokio::test]
async fn parallel_block_merges_when_all_providers_succeed() {
    let fixture = Fixture::new();
    let p1 = MockProvider::scripted("p1", &["stop"]);
    let p2 = MockProvider::scripted("p2", &["stop"]);
    let engine =
        Engine::new(fixture.engine_config()).with_registry(registry_with(vec![p1, p2]));

    let end = engine
        .run(fixture.request("par-ok", "pipeline", PARALLEL_YAML))
        .await
        .unwrap();
    assert_eq!(end, RunEnd::Completed);

    let block = fixture.session_dir("par-ok").join("parallel-00-impls");
    for provider in ["p1", "p2"] {
        let scope = block.join("providers").join(provider);
        assert!(
            scope
                .join("stage-00-implement/iterations/001/output.md")
                .exists(),
            "missing output for {}",
            provider
        );
    }

    let manifest = MergeManifest::load(&block.join("manifest.json")).unwrap();
    assert_eq!(manifest.block.name, "impls");
    for provider in ["p1", "p2"] {
        let summary = &manifest.providers[provider]["implement"];
        assert_eq!(summary.iterations, 1);
        assert_eq!(summary.status, "completed");
    }

    let events = fixture.events("par-ok");
    assert_eq!(
        count_events(&events, EventType::ParallelProviderComplete),
        2
    );
    assert_eq!(count_events(&events, EventType::WorkerComplete), 2);
}

// =============================================================================
// Scenario 6: partial parallel failure
// =============================================================================

#[tokio::test]
async fn partial_parallel_failure_writes_no_manifest() {
    let fixture = Fixture::new();
    let p1 = MockProvider::scripted("p1", &["stop"]);
    let p2 = MockProvider::crashing("p2");
    let engine =
        Engine::new(fixture.engine_config()).with_registry(registry_with(vec![p1, p2]));

    let err = engine
        .run(fixture.request("par-fail", "pipeline", PARALLEL_YAML))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("p2"), "{err:#}");

    let block = fixture.session_dir("par-fail").join("parallel-00-impls");
    assert!(!block.join("manifest.json").exists());

    let state = fixture.state("par-fail");
    assert_eq!(state.status, SessionStatus::Failed);
    assert_eq!(state.error_type, Some(ErrorKind::ProviderCrashed));

    let events = fixture.events("par-fail");
    let p1_completed = events.iter().any(|e| {
        e.kind == EventType::ParallelProviderComplete
            && e.cursor
                .as_ref()
                .is_some_and(|c| c.provider.as_deref() == Some("p1"))
    });
    assert!(p1_completed, "p1 should have completed");
    let p2_error = events.iter().any(|e| {
        e.kind == EventType::Error
            && e.cursor
                .as_ref()
                .is_some_and(|c| c.provider.as_deref() == Some("p2"))
    });
    assert!(p2_error, "p2 should have an error event");
}

// =============================================================================
// Multi-stage flow and from_stage handoff
// =============================================================================

#[tokio::test]
async fn pipeline_hands_outputs_between_stages() {
    let fixture = Fixture::new();
    let mock = MockProvider::scripted("mock", &["stop"]);
    let engine =
        Engine::new(fixture.engine_config()).with_registry(registry_with(vec![mock]));

    let yaml = r#"
name: handoff
provider: mock
stages:
  - id: plan
    prompt: "plan"
    termination: { type: fixed, count: 1 }
  - id: build
    prompt: "build"
    termination: { type: fixed, count: 1 }
    inputs:
      from_stage: { plan: latest }
"#;
    let end = engine
        .run(fixture.request("handoff", "pipeline", yaml))
        .await
        .unwrap();
    assert_eq!(end, RunEnd::Completed);

    // The build stage's context lists the plan stage's output.
    let context_path = fixture
        .session_dir("handoff")
        .join("stage-01-build/iterations/001/context.json");
    let context: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(context_path).unwrap()).unwrap();
    let from_stage = context["inputs"]["from_stage"]["plan"][0].as_str().unwrap();
    assert!(from_stage.ends_with("stage-00-plan/iterations/001/output.md"));

    let state = fixture.state("handoff");
    assert_eq!(state.completed_stages, vec!["0#0", "1#0"]);
}

// =============================================================================
// Error decision and missing results
// =============================================================================

#[tokio::test]
async fn error_decision_fails_the_session() {
    let fixture = Fixture::new();
    let mock = MockProvider::scripted("mock", &["error"]);
    let engine =
        Engine::new(fixture.engine_config()).with_registry(registry_with(vec![mock]));

    let yaml = r#"
name: errs
provider: mock
stages:
  - id: work
    prompt: "iterate"
    termination: { type: fixed, count: 3 }
"#;
    let err = engine
        .run(fixture.request("errs", "loop", yaml))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("mock error"), "{err:#}");

    let state = fixture.state("errs");
    assert_eq!(state.status, SessionStatus::Failed);
    let events = fixture.events("errs");
    assert_eq!(count_events(&events, EventType::Error), 1);
}

#[tokio::test]
async fn missing_result_is_retried_then_fatal() {
    let fixture = Fixture::new();
    let mock = MockProvider::silent("mock");
    let engine =
        Engine::new(fixture.engine_config()).with_registry(registry_with(vec![mock]));

    let yaml = r#"
name: silent
provider: mock
stages:
  - id: work
    prompt: "iterate"
    termination: { type: fixed, count: 2 }
"#;
    let err = engine
        .run(fixture.request("silent", "loop", yaml))
        .await
        .unwrap_err();
    let failure = err
        .downcast_ref::<conductor::driver::StageFailure>()
        .expect("typed stage failure");
    assert_eq!(failure.kind, ErrorKind::ResultMissing);

    let state = fixture.state("silent");
    assert_eq!(state.status, SessionStatus::Failed);
    assert_eq!(state.error_type, Some(ErrorKind::ResultMissing));

    // error.json names the failure in the iteration directory.
    let error_path = fixture
        .session_dir("silent")
        .join("stage-00-work/iterations/001/error.json");
    assert!(error_path.exists());
}

// =============================================================================
// Pause via hooks, resume via request
// =============================================================================

#[tokio::test]
async fn hook_pause_persists_and_resume_continues() {
    use conductor::hooks::{HookContext, HookDispatcher, HookPoint, HookVerdict};

    let fixture = Fixture::new();
    let yaml = r#"
name: pausey
provider: mock
stages:
  - id: work
    prompt: "iterate"
    max_iterations: 4
    termination: { type: fixed, count: 4 }
"#;

    // Pause after the second completed iteration.
    let mut hooks = HookDispatcher::new();
    hooks.register(
        HookPoint::IterationEnd,
        Box::new(|_: HookPoint, cx: &HookContext<'_>| {
            if cx.iteration == Some(2) {
                HookVerdict::Pause
            } else {
                HookVerdict::Continue
            }
        }),
    );
    let mock = MockProvider::scripted("mock", &["continue"]);
    let engine = Engine::new(fixture.engine_config())
        .with_registry(registry_with(vec![mock]))
        .with_hooks(hooks);

    let end = engine
        .run(fixture.request("pausey", "loop", yaml))
        .await
        .unwrap();
    assert_eq!(end, RunEnd::Paused);
    assert_eq!(fixture.state("pausey").status, SessionStatus::Paused);

    // Resume picks up at iteration 3.
    let mock = MockProvider::scripted("mock", &["continue"]);
    let engine =
        Engine::new(fixture.engine_config()).with_registry(registry_with(vec![mock]));
    let mut request = fixture.request("pausey", "loop", yaml);
    request.resume = true;
    let end = engine.run(request).await.unwrap();
    assert_eq!(end, RunEnd::Completed);

    let state = fixture.state("pausey");
    assert_eq!(state.iteration_completed, 4);
    let events = fixture.events("pausey");
    assert_eq!(count_events(&events, EventType::IterationComplete), 4);
    assert_eq!(count_events(&events, EventType::SessionPaused), 1);
    assert_eq!(count_events(&events, EventType::SessionResumed), 1);
}

// =============================================================================
// Judge override
// =============================================================================

#[tokio::test]
async fn judge_verdict_stops_a_stage_that_would_keep_going() {
    let fixture = Fixture::new();
    std::fs::create_dir_all(fixture.root.join("templates")).unwrap();
    std::fs::write(
        fixture.root.join("templates/judge.md"),
        "Judge session {{SESSION}} iteration {{ITERATION}} via {{RESULT}}.",
    )
    .unwrap();

    // The worker would continue forever; the judge calls it done.
    let worker = MockProvider::scripted("mock", &["continue"]);
    let judge = MockProvider::answering(
        "arbiter",
        "```json\n{\"stop\": true, \"reason\": \"plateaued\", \"confidence\": 0.95}\n```",
    );
    let engine = Engine::new(fixture.engine_config())
        .with_registry(registry_with(vec![worker, judge]));

    let yaml = r#"
name: judged
provider: mock
stages:
  - id: refine
    prompt: "refine"
    max_iterations: 10
    termination:
      type: judgment
      min_iterations: 1
      consensus: 2
      judge: { template: judge, provider: arbiter }
"#;
    let end = engine
        .run(fixture.request("judged", "loop", yaml))
        .await
        .unwrap();
    assert_eq!(end, RunEnd::Completed);

    let state = fixture.state("judged");
    assert_eq!(state.iteration_completed, 1);

    let events = fixture.events("judged");
    assert_eq!(count_events(&events, EventType::JudgeStart), 1);
    assert_eq!(count_events(&events, EventType::JudgeComplete), 1);

    // judge.json persisted the normalized verdict.
    let judge_path = fixture
        .session_dir("judged")
        .join("stage-00-refine/iterations/001/judge.json");
    let verdict: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(judge_path).unwrap()).unwrap();
    assert_eq!(verdict["stop"], true);
    assert_eq!(verdict["reason"], "plateaued");
}

// =============================================================================
// Unknown provider fails fast
// =============================================================================

#[tokio::test]
async fn unknown_provider_fails_before_spawning_anything() {
    let fixture = Fixture::new();
    let engine = Engine::new(fixture.engine_config())
        .with_registry(registry_with(vec![MockProvider::scripted("mock", &["stop"])]));

    let yaml = r#"
name: nope
provider: ghost
stages:
  - id: work
    prompt: "iterate"
    termination: { type: fixed, count: 1 }
"#;
    let err = engine
        .run(fixture.request("nope", "loop", yaml))
        .await
        .unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("ghost"), "{message}");
    assert!(message.contains("mock"), "lists available providers");
}
