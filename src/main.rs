use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use conductor::cmd::{self, EXIT_RUNTIME, EXIT_USER};
use conductor::config::{CliOverrides, Config};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Iterative agent orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags accepted by the run verbs.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Take over a session even if a live lock holder exists
    #[arg(long)]
    pub force: bool,

    /// Continue a paused or failed session
    #[arg(long)]
    pub resume: bool,

    /// Recompile the plan even if the cached one is current
    #[arg(long)]
    pub recompile: bool,

    /// Run attached to the terminal (the default; kept for compatibility)
    #[arg(long)]
    pub foreground: bool,

    /// Additional initial input path (repeatable)
    #[arg(long = "input")]
    pub inputs: Vec<PathBuf>,

    /// Provider override (beats PIPELINE_PROVIDER and all config layers)
    #[arg(long)]
    pub provider: Option<String>,

    /// Model override
    #[arg(long)]
    pub model: Option<String>,

    /// Extra context text exposed to prompts as {{CONTEXT}}
    #[arg(long)]
    pub context: Option<String>,

    /// Command map entry as key=cmd (repeatable)
    #[arg(long = "command", value_parser = parse_key_val)]
    pub commands: Vec<(String, String)>,
}

impl RunArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            provider: self.provider.clone(),
            model: self.model.clone(),
            context: self.context.clone(),
            commands: self.commands.iter().cloned().collect(),
            inputs: self.inputs.clone(),
            runs: None,
            max_iterations: None,
        }
    }

    fn flags(&self) -> cmd::run::RunFlags {
        cmd::run::RunFlags {
            force: self.force,
            resume: self.resume,
            recompile: self.recompile,
            foreground: self.foreground,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scaffold .conductor/ with starter definitions
    Init,
    /// Run a multi-stage pipeline
    Pipeline {
        /// Pipeline name or YAML path
        file: String,
        session: Option<String>,
        /// Repeat the whole node sequence this many times
        runs: Option<u32>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Show a session's state snapshot
    Status { session: String },
    /// Show the last events of a session
    Tail {
        session: String,
        #[arg(default_value_t = 20)]
        lines: usize,
    },
    /// List recent sessions
    List {
        #[arg(default_value_t = 10)]
        count: usize,
    },
    /// Validate loop and pipeline definitions
    Lint {
        kind: Option<String>,
        name: Option<String>,
    },
    /// Compile and preview without running agents
    DryRun {
        kind: String,
        name: String,
        session: Option<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// `conductor <type> [session] [max]` - run a loop definition
    #[command(external_subcommand)]
    Loop(Vec<String>),
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=cmd, got '{}'", raw)),
    }
}

/// Diagnostics go to stderr; `CONDUCTOR_LOG` sets the filter and
/// `CONDUCTOR_LOG_DIR` adds a daily-rolling file. The returned guard must
/// outlive the program so buffered file logs flush on exit.
fn init_tracing(verbose: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("CONDUCTOR_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));

    if let Ok(dir) = std::env::var("CONDUCTOR_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(dir, "conductor.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        return Some(guard);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<u8> {
    let config = Config::new(cli.project_dir.clone(), cli.verbose)?;

    match cli.command {
        Commands::Init => cmd::cmd_init(&config),
        Commands::Pipeline {
            file,
            session,
            runs,
            run,
        } => {
            cmd::cmd_pipeline(
                &config,
                &file,
                session,
                runs,
                &run.overrides(),
                &run.flags(),
            )
            .await
        }
        Commands::Status { session } => cmd::cmd_status(&config, &session),
        Commands::Tail { session, lines } => cmd::cmd_tail(&config, &session, lines),
        Commands::List { count } => cmd::cmd_list(&config, count),
        Commands::Lint { kind, name } => {
            cmd::cmd_lint(&config, kind.as_deref(), name.as_deref())
        }
        Commands::DryRun {
            kind,
            name,
            session,
            run,
        } => cmd::cmd_dry_run(&config, &kind, &name, session, &run.overrides()),
        Commands::Loop(raw) => {
            let parsed = match LoopInvocation::parse(raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    eprintln!("error: {:#}", e);
                    return Ok(EXIT_USER);
                }
            };
            cmd::cmd_run_loop(
                &config,
                &parsed.loop_type,
                parsed.session,
                parsed.max,
                &parsed.run.overrides(),
                &parsed.run.flags(),
            )
            .await
        }
    }
}

/// Hand-parsed `<type> [session] [max]` invocation: the loop type is
/// dynamic, so clap sees it as an external subcommand and leaves the
/// arguments raw.
#[derive(Debug, Default)]
struct LoopInvocation {
    loop_type: String,
    session: Option<String>,
    max: Option<u32>,
    run: RunArgs,
}

impl LoopInvocation {
    fn parse(raw: Vec<String>) -> Result<Self> {
        let mut parsed = LoopInvocation::default();
        let mut positionals: Vec<String> = Vec::new();
        let mut iter = raw.into_iter().peekable();

        while let Some(arg) = iter.next() {
            let (flag, inline_value) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (arg.clone(), None),
            };
            let mut take_value = |name: &str| -> Result<String> {
                if let Some(value) = inline_value.clone() {
                    return Ok(value);
                }
                match iter.next() {
                    Some(value) => Ok(value),
                    None => bail!("{} requires a value", name),
                }
            };

            match flag.as_str() {
                "--force" => parsed.run.force = true,
                "--resume" => parsed.run.resume = true,
                "--recompile" => parsed.run.recompile = true,
                "--foreground" => parsed.run.foreground = true,
                "--input" => parsed.run.inputs.push(PathBuf::from(take_value("--input")?)),
                "--provider" => parsed.run.provider = Some(take_value("--provider")?),
                "--model" => parsed.run.model = Some(take_value("--model")?),
                "--context" => parsed.run.context = Some(take_value("--context")?),
                "--command" => {
                    let raw = take_value("--command")?;
                    let pair = parse_key_val(&raw).map_err(|e| anyhow::anyhow!(e))?;
                    parsed.run.commands.push(pair);
                }
                other if other.starts_with("--") => {
                    bail!("unknown flag '{}'", other);
                }
                _ => positionals.push(arg),
            }
        }

        let mut positionals = positionals.into_iter();
        parsed.loop_type = match positionals.next() {
            Some(loop_type) => loop_type,
            None => bail!("missing loop type"),
        };
        parsed.session = positionals.next();
        if let Some(max) = positionals.next() {
            parsed.max = Some(
                max.parse()
                    .map_err(|_| anyhow::anyhow!("max must be a number, got '{}'", max))?,
            );
        }
        if let Some(extra) = positionals.next() {
            bail!("unexpected argument '{}'", extra);
        }
        Ok(parsed)
    }
}
