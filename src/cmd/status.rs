//! Session inspection — `status`, `list`, `tail`.

use anyhow::Result;
use console::style;
use walkdir::WalkDir;

use crate::cmd::{EXIT_OK, EXIT_USER};
use crate::config::Config;
use crate::events::EventLog;
use crate::session::SessionPaths;
use crate::state::{SessionState, SessionStatus, StateStore};

/// `conductor status <session>`.
pub fn cmd_status(config: &Config, session: &str) -> Result<u8> {
    let paths = SessionPaths::new(&config.runs_root, &config.locks_root, session)?;
    let store = StateStore::new(paths.state_path());
    if !store.exists() {
        eprintln!(
            "{} no session '{}' under {}",
            style("error:").red().bold(),
            session,
            config.runs_root.display()
        );
        return Ok(EXIT_USER);
    }
    let state = store.load()?;

    println!("{}", style(&state.session).cyan().bold());
    println!("  kind:       {}", state.kind);
    println!("  pipeline:   {}", state.pipeline);
    println!("  status:     {}", styled_status(state.status));
    if let Some(stage) = &state.current_stage {
        println!("  stage:      {}", stage);
    }
    println!(
        "  iteration:  {} (completed {})",
        state.iteration, state.iteration_completed
    );
    println!("  started:    {}", state.started_at.to_rfc3339());
    println!("  updated:    {}", state.updated_at.to_rfc3339());
    if !state.completed_stages.is_empty() {
        println!("  stages done: {}", state.completed_stages.join(", "));
    }
    if let Some(error) = &state.error {
        let kind = state
            .error_type
            .map(|k| format!(" [{}]", k))
            .unwrap_or_default();
        println!("  error:      {}{}", style(error).red(), kind);
    }
    Ok(EXIT_OK)
}

/// `conductor tail <session> [lines]`.
pub fn cmd_tail(config: &Config, session: &str, lines: usize) -> Result<u8> {
    let paths = SessionPaths::new(&config.runs_root, &config.locks_root, session)?;
    let log = EventLog::new(paths.events_path());
    let events = log.read()?;
    if events.is_empty() {
        eprintln!(
            "{} no events for session '{}'",
            style("error:").red().bold(),
            session
        );
        return Ok(EXIT_USER);
    }

    let start = events.len().saturating_sub(lines);
    for event in &events[start..] {
        let cursor = event
            .cursor
            .as_ref()
            .map(|c| {
                let provider = c
                    .provider
                    .as_deref()
                    .map(|p| format!(" {}", p))
                    .unwrap_or_default();
                format!(" [{} run {} iter {}{}]", c.node_path, c.node_run, c.iteration, provider)
            })
            .unwrap_or_default();
        println!(
            "{} {}{}",
            style(event.ts.format("%H:%M:%S")).dim(),
            serde_json::to_value(event.kind)?
                .as_str()
                .unwrap_or("unknown"),
            cursor
        );
    }
    Ok(EXIT_OK)
}

/// `conductor list [count]`.
pub fn cmd_list(config: &Config, count: usize) -> Result<u8> {
    let mut sessions: Vec<SessionState> = Vec::new();
    if config.runs_root.exists() {
        for entry in WalkDir::new(&config.runs_root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let store = StateStore::new(entry.path().join("state.json"));
            if !store.exists() {
                continue;
            }
            match store.load() {
                Ok(state) => sessions.push(state),
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "unreadable state");
                }
            }
        }
    }

    if sessions.is_empty() {
        println!("no sessions yet");
        return Ok(EXIT_OK);
    }

    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    sessions.truncate(count);

    for state in &sessions {
        println!(
            "{:<28} {:<10} {:<10} iter {:>3}  {}",
            style(&state.session).cyan(),
            styled_status(state.status),
            state.kind,
            state.iteration_completed,
            state.updated_at.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(EXIT_OK)
}

fn styled_status(status: SessionStatus) -> String {
    let text = status.as_str();
    match status {
        SessionStatus::Completed => style(text).green().to_string(),
        SessionStatus::Running => style(text).cyan().to_string(),
        SessionStatus::Paused => style(text).yellow().to_string(),
        SessionStatus::Failed | SessionStatus::Aborted => style(text).red().to_string(),
        SessionStatus::Pending => style(text).dim().to_string(),
    }
}
