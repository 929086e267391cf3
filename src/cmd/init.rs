//! Project scaffolding — `init`.
//!
//! Creates `.conductor/` with a starter loop, pipeline, and templates.
//! Never overwrites existing files.

use anyhow::Result;
use console::style;
use std::path::Path;

use crate::cmd::EXIT_OK;
use crate::config::Config;

const STARTER_TOML: &str = r#"# conductor project configuration
# provider = "claude"
# model = "sonnet"
# provider_timeout_seconds = 900

[commands]
# test = "cargo test"
"#;

const STARTER_LOOP: &str = r#"# A single-stage loop: `conductor task [session] [max]`
name: task
template: task
termination:
  type: judgment
  min_iterations: 2
  consensus: 2
max_iterations: 10
inputs:
  from_previous_iterations: true
"#;

const STARTER_PIPELINE: &str = r#"# A two-stage pipeline: `conductor pipeline plan-then-build`
name: plan-then-build
stages:
  - id: plan
    template: task
    termination: { type: fixed, count: 1 }
  - id: build
    template: task
    termination:
      type: judgment
      min_iterations: 2
      consensus: 2
    inputs:
      from_stage: { plan: latest }
      from_previous_iterations: true
"#;

const STARTER_TEMPLATE: &str = r#"You are one iteration of a long-running task session.

Read your context manifest at {{CTX}} before doing anything else. It lists
your inputs, the paths you own, and how many iterations remain.

Work on the task, then:
1. Append a short progress note to {{PROGRESS}}.
2. Write your main output to {{OUTPUT}}.
3. Write {{RESULT}} as JSON: {"decision": "continue" | "stop", "summary": "..."}.
   Decide "stop" only when the task is genuinely done.

Session: {{SESSION}} - iteration {{ITERATION}}.
{{CONTEXT}}
"#;

const STARTER_JUDGE: &str = r#"You are judging whether an iterative session should stop.

Read the latest result at {{RESULT}} and the output at {{OUTPUT}}.

Answer with JSON only:
{"stop": true|false, "reason": "...", "confidence": 0.0-1.0}
"#;

pub fn cmd_init(config: &Config) -> Result<u8> {
    config.ensure_directories()?;

    let files = [
        (config.conductor_dir.join("conductor.toml"), STARTER_TOML),
        (config.loops_dir.join("task.yaml"), STARTER_LOOP),
        (
            config.pipelines_dir.join("plan-then-build.yaml"),
            STARTER_PIPELINE,
        ),
        (config.templates_dir.join("task.md"), STARTER_TEMPLATE),
        (config.templates_dir.join("judge.md"), STARTER_JUDGE),
    ];

    for (path, content) in files {
        write_if_absent(&path, content)?;
    }

    println!(
        "{} {}",
        style("initialized").green().bold(),
        config.conductor_dir.display()
    );
    println!("try: conductor lint && conductor dry-run loop task");
    Ok(EXIT_OK)
}

fn write_if_absent(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        println!("  {} {}", style("kept").dim(), path.display());
        return Ok(());
    }
    std::fs::write(path, content)?;
    println!("  {} {}", style("wrote").green(), path.display());
    Ok(())
}
