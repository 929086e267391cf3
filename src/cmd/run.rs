//! Session execution — the dynamic `<loop-type>` verb and `pipeline`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use crate::cmd::{EXIT_OK, EXIT_RUNTIME, EXIT_USER};
use crate::config::{CliOverrides, Config};
use crate::driver::StageFailure;
use crate::engine::{Engine, RunEnd, RunRequest};
use crate::errors::LockError;
use crate::pipeline::PipelineDef;
use crate::session::validate_session_name;

/// Flags shared by both run verbs.
#[derive(Debug, Clone, Default)]
pub struct RunFlags {
    pub force: bool,
    pub resume: bool,
    pub recompile: bool,
    pub foreground: bool,
}

/// `conductor <type> [session] [max]` — run a loop definition.
pub async fn cmd_run_loop(
    config: &Config,
    loop_type: &str,
    session: Option<String>,
    max: Option<u32>,
    cli: &CliOverrides,
    flags: &RunFlags,
) -> Result<u8> {
    let source = match config.find_loop(loop_type) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            return Ok(EXIT_USER);
        }
    };
    let mut def = match PipelineDef::from_loop(&source, loop_type) {
        Ok(def) => def,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            return Ok(EXIT_USER);
        }
    };
    apply_project_defaults(config, &mut def);

    let session = session.unwrap_or_else(|| default_session_name(loop_type));
    let mut cli = cli.clone();
    if cli.max_iterations.is_none() {
        cli.max_iterations = max;
    }

    execute(config, "loop", def, &source, session, &cli, flags).await
}

/// `conductor pipeline <file.yaml> [session] [runs]`.
pub async fn cmd_pipeline(
    config: &Config,
    pipeline: &str,
    session: Option<String>,
    runs: Option<u32>,
    cli: &CliOverrides,
    flags: &RunFlags,
) -> Result<u8> {
    let source = match config.find_pipeline(pipeline) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            return Ok(EXIT_USER);
        }
    };
    let mut def = match PipelineDef::load(&source) {
        Ok(def) => def,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            return Ok(EXIT_USER);
        }
    };
    apply_project_defaults(config, &mut def);

    let name = def
        .name
        .clone()
        .or_else(|| {
            source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "pipeline".to_string());
    let session = session.unwrap_or_else(|| default_session_name(&name));
    let mut cli = cli.clone();
    if cli.runs.is_none() {
        cli.runs = runs;
    }

    execute(config, "pipeline", def, &source, session, &cli, flags).await
}

/// Project-level defaults sit beneath pipeline config in the precedence
/// chain.
fn apply_project_defaults(config: &Config, def: &mut PipelineDef) {
    if def.provider.is_none() {
        def.provider = config.default_provider().map(str::to_string);
    }
    if def.model.is_none() {
        def.model = config.default_model().map(str::to_string);
    }
}

async fn execute(
    config: &Config,
    kind: &str,
    def: PipelineDef,
    source: &Path,
    session: String,
    cli: &CliOverrides,
    flags: &RunFlags,
) -> Result<u8> {
    if let Err(e) = validate_session_name(&session) {
        eprintln!("{} {:#}", style("error:").red().bold(), e);
        return Ok(EXIT_USER);
    }
    config.ensure_directories()?;

    let source_text = std::fs::read_to_string(source)
        .with_context(|| format!("failed to read {}", source.display()))?;

    let engine =
        Engine::new(config.engine_config()).with_registry(config.build_registry());
    let _signals = engine.spawn_signal_handler();

    let request = RunRequest {
        session: session.clone(),
        kind: kind.to_string(),
        def,
        source: source.to_path_buf(),
        source_text,
        overrides: config.overrides(cli),
        force: flags.force,
        resume: flags.resume,
        recompile: flags.recompile,
    };

    println!(
        "{} session {} ({})",
        style("starting").green().bold(),
        style(&session).cyan(),
        kind
    );

    match engine.run(request).await {
        Ok(RunEnd::Completed) => {
            println!("{} session {}", style("completed").green().bold(), session);
            Ok(EXIT_OK)
        }
        Ok(RunEnd::Paused) => {
            println!(
                "{} session {} (resume with: conductor {} --resume {})",
                style("paused").yellow().bold(),
                session,
                resume_verb(kind, source),
                session
            );
            Ok(EXIT_OK)
        }
        Ok(RunEnd::Aborted) => {
            eprintln!("{} session {} aborted", style("aborted").red().bold(), session);
            Ok(EXIT_USER)
        }
        Err(e) => {
            if let Some(lock) = e.downcast_ref::<LockError>() {
                eprintln!("{} {}", style("error:").red().bold(), lock);
                return Ok(EXIT_USER);
            }
            if let Some(failure) = e.downcast_ref::<StageFailure>() {
                eprintln!(
                    "{} {} ({})",
                    style("failed:").red().bold(),
                    failure.message,
                    failure.kind
                );
            } else {
                eprintln!("{} {:#}", style("failed:").red().bold(), e);
            }
            // Every fatal path prints a one-line resume command.
            eprintln!(
                "resume with: conductor {} --resume {}",
                resume_verb(kind, source),
                session
            );
            Ok(EXIT_RUNTIME)
        }
    }
}

fn resume_verb(kind: &str, source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match kind {
        "pipeline" => format!("pipeline {}", stem),
        _ => stem,
    }
}

fn default_session_name(base: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &suffix[..8])
}
