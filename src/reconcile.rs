//! Crash reconciliation.
//!
//! When the state snapshot is missing, stale, or inconsistent (and no live
//! lock holder exists), the session state is rebuilt from the event log,
//! which is the source of truth. Reconstruction never loses a completed
//! iteration: `resume_from` lands at or after the true last completed one.

use serde_json::Value;
use tracing::info;

use crate::driver::node_key;
use crate::events::{Event, EventType};
use crate::state::{IterationRecord, SessionState, SessionStatus};

/// Rebuild a session state from its events.
///
/// `kind` and `pipeline` come from the plan, since early events may predate
/// the fields that would carry them.
pub fn reconcile(session: &str, kind: &str, pipeline: &str, events: &[Event]) -> SessionState {
    let mut state = SessionState::new(session, kind, pipeline);
    state.events_processed = events.len() as u64;

    if let Some(first) = events.first() {
        state.started_at = first.ts;
    }
    if let Some(last) = events.last() {
        state.updated_at = last.ts;
    }

    for event in events {
        match event.kind {
            EventType::SessionStart | EventType::SessionResumed => {
                state.status = SessionStatus::Running;
                state.error = None;
                state.error_type = None;
            }
            EventType::SessionPaused => {
                state.status = SessionStatus::Paused;
            }
            EventType::SessionComplete => {
                state.status = SessionStatus::Completed;
            }
            EventType::NodeStart => {
                if let Some(cursor) = &event.cursor {
                    // A new stage instance resets per-stage progress; a
                    // repeated node_start for the current instance is a
                    // resume artifact and changes nothing.
                    let key = node_key(&cursor.node_path, cursor.node_run);
                    if state.current_stage.as_deref() != Some(key.as_str()) {
                        state.enter_stage(&key);
                    }
                }
            }
            EventType::NodeComplete => {
                if let Some(cursor) = &event.cursor {
                    let key = node_key(&cursor.node_path, cursor.node_run);
                    if !state.completed_stages.contains(&key) {
                        state.completed_stages.push(key);
                    }
                }
            }
            EventType::IterationStart => {
                if let Some(cursor) = &event.cursor {
                    if cursor.provider.is_none() {
                        let key = node_key(&cursor.node_path, cursor.node_run);
                        if state.current_stage.as_deref() != Some(key.as_str()) {
                            // Missing node_start (older logs): infer it.
                            state.enter_stage(&key);
                        }
                        state.iteration = cursor.iteration;
                        state.iteration_started = Some(event.ts);
                    }
                }
            }
            EventType::IterationComplete => {
                if let Some(cursor) = &event.cursor {
                    if cursor.provider.is_none() {
                        state.iteration_completed = cursor.iteration;
                        state.iteration_started = None;
                        if let Some(record) = record_from_data(cursor.iteration, &event.data) {
                            state.history.push(record);
                        }
                    }
                }
            }
            EventType::Error => {
                if let Some(message) = event.data.get("message").and_then(Value::as_str) {
                    state.error = Some(message.to_string());
                }
                if let Some(kind) = event
                    .data
                    .get("error_type")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                {
                    state.error_type = Some(kind);
                    // A classified error is a fatal path: the session needs
                    // an explicit resume.
                    if state.status == SessionStatus::Running {
                        state.status = SessionStatus::Failed;
                    }
                }
            }
            EventType::ParallelProviderStart
            | EventType::ParallelProviderComplete
            | EventType::JudgeStart
            | EventType::JudgeComplete
            | EventType::WorkerComplete => {}
        }
    }

    info!(
        session,
        status = %state.status,
        resume_from = state.resume_from(),
        "state reconciled from {} events",
        events.len()
    );
    state
}

/// `iteration_complete` events embed the history record in their payload.
fn record_from_data(iteration: u32, data: &Value) -> Option<IterationRecord> {
    let record = data.get("record")?;
    let mut record: IterationRecord = serde_json::from_value(record.clone()).ok()?;
    record.iteration = iteration;
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Cursor;
    use crate::report::Decision;
    use chrono::Utc;
    use serde_json::json;

    fn event(kind: EventType, cursor: Option<Cursor>, data: Value) -> Event {
        Event {
            ts: Utc::now(),
            kind,
            session: "alpha".into(),
            cursor,
            data,
        }
    }

    fn complete_event(node: &str, iteration: u32, decision: &str) -> Event {
        event(
            EventType::IterationComplete,
            Some(Cursor::new(node, 0, iteration)),
            json!({"record": {
                "iteration": iteration,
                "decision": decision,
                "timestamp": Utc::now().to_rfc3339(),
            }}),
        )
    }

    #[test]
    fn rebuilds_progress_from_events() {
        let events = vec![
            event(EventType::SessionStart, None, json!({})),
            event(EventType::NodeStart, Some(Cursor::new("0", 0, 0)), json!({})),
            event(
                EventType::IterationStart,
                Some(Cursor::new("0", 0, 1)),
                json!({}),
            ),
            complete_event("0", 1, "continue"),
            event(
                EventType::IterationStart,
                Some(Cursor::new("0", 0, 2)),
                json!({}),
            ),
            complete_event("0", 2, "continue"),
        ];

        let state = reconcile("alpha", "pipeline", "refactor", &events);
        assert_eq!(state.status, SessionStatus::Running);
        assert_eq!(state.iteration_completed, 2);
        assert_eq!(state.resume_from(), 3);
        assert!(state.iteration_started.is_none());
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[1].decision, Decision::Continue);
        assert_eq!(state.events_processed, 6);
    }

    #[test]
    fn crash_mid_iteration_resumes_at_the_crashed_index() {
        let events = vec![
            event(EventType::SessionStart, None, json!({})),
            event(EventType::NodeStart, Some(Cursor::new("0", 0, 0)), json!({})),
            event(
                EventType::IterationStart,
                Some(Cursor::new("0", 0, 1)),
                json!({}),
            ),
            complete_event("0", 1, "continue"),
            // Iteration 2 started, then the process died.
            event(
                EventType::IterationStart,
                Some(Cursor::new("0", 0, 2)),
                json!({}),
            ),
        ];

        let state = reconcile("alpha", "loop", "fix", &events);
        assert_eq!(state.iteration, 2);
        assert_eq!(state.iteration_completed, 1);
        assert!(state.has_incomplete_iteration());
        // Never re-run the completed iteration; re-run the crashed one.
        assert_eq!(state.resume_from(), 2);
    }

    #[test]
    fn stage_transition_resets_iteration_counters() {
        let events = vec![
            event(EventType::SessionStart, None, json!({})),
            event(EventType::NodeStart, Some(Cursor::new("0", 0, 0)), json!({})),
            complete_event("0", 3, "stop"),
            event(
                EventType::NodeComplete,
                Some(Cursor::new("0", 0, 3)),
                json!({}),
            ),
            event(EventType::NodeStart, Some(Cursor::new("1", 0, 0)), json!({})),
        ];

        let state = reconcile("alpha", "pipeline", "refactor", &events);
        assert_eq!(state.completed_stages, vec!["0#0".to_string()]);
        assert_eq!(state.current_stage.as_deref(), Some("1#0"));
        assert_eq!(state.iteration_completed, 0);
        assert!(state.history.is_empty());
    }

    #[test]
    fn completed_session_reconciles_as_completed() {
        let events = vec![
            event(EventType::SessionStart, None, json!({})),
            event(EventType::SessionComplete, None, json!({})),
        ];
        let state = reconcile("alpha", "loop", "fix", &events);
        assert_eq!(state.status, SessionStatus::Completed);
    }

    #[test]
    fn parallel_worker_events_do_not_move_the_main_cursor() {
        let worker_cursor = Cursor::new("1", 0, 1).with_provider("claude");
        let events = vec![
            event(EventType::SessionStart, None, json!({})),
            event(EventType::NodeStart, Some(Cursor::new("1", 0, 0)), json!({})),
            event(
                EventType::IterationComplete,
                Some(worker_cursor),
                json!({"record": {"iteration": 1, "decision": "stop", "timestamp": Utc::now().to_rfc3339()}}),
            ),
        ];
        let state = reconcile("alpha", "pipeline", "refactor", &events);
        // Worker iterations are scoped to their provider state, not the
        // session cursor.
        assert_eq!(state.iteration_completed, 0);
        assert!(state.history.is_empty());
    }

    #[test]
    fn error_events_surface_in_state() {
        let events = vec![
            event(EventType::SessionStart, None, json!({})),
            event(
                EventType::Error,
                Some(Cursor::new("0", 0, 1)),
                json!({"message": "provider crashed", "error_type": "provider_crashed"}),
            ),
        ];
        let state = reconcile("alpha", "loop", "fix", &events);
        assert_eq!(state.status, SessionStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("provider crashed"));
        assert_eq!(
            state.error_type,
            Some(crate::errors::ErrorKind::ProviderCrashed)
        );
    }
}
