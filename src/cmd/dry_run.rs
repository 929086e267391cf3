//! Plan preview — `dry-run <loop|pipeline> <name> [session]`.
//!
//! Compiles the definition and prints the node plan plus a render preview
//! of the first stage's prompt, without spawning any agent.

use anyhow::Result;
use console::style;

use crate::cmd::lint::load_def;
use crate::cmd::{EXIT_OK, EXIT_USER};
use crate::config::{CliOverrides, Config};
use crate::pipeline::{Node, compile};
use crate::template::{TemplateVars, resolve};

pub fn cmd_dry_run(
    config: &Config,
    kind: &str,
    name: &str,
    session: Option<String>,
    cli: &CliOverrides,
) -> Result<u8> {
    let is_loop = match kind {
        "loop" => true,
        "pipeline" => false,
        other => {
            eprintln!(
                "{} dry-run expects 'loop' or 'pipeline', got '{}'",
                style("error:").red().bold(),
                other
            );
            return Ok(EXIT_USER);
        }
    };

    let source = if is_loop {
        config.find_loop(name)
    } else {
        config.find_pipeline(name)
    };
    let source = match source {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            return Ok(EXIT_USER);
        }
    };

    let mut def = match load_def(&source, is_loop) {
        Ok(def) => def,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            return Ok(EXIT_USER);
        }
    };
    if def.provider.is_none() {
        def.provider = config.default_provider().map(str::to_string);
    }

    let source_text = std::fs::read_to_string(&source)?;
    let plan = match compile(
        &def,
        if is_loop { "loop" } else { "pipeline" },
        &source,
        &source_text,
        &config.overrides(cli),
    ) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            return Ok(EXIT_USER);
        }
    };

    let session = session.unwrap_or_else(|| format!("{}-dry", plan.pipeline));
    println!(
        "{} {} ({} nodes, {} stages)",
        style("plan").cyan().bold(),
        plan.pipeline,
        plan.nodes.len(),
        plan.stage_count()
    );
    for node in &plan.nodes {
        match node {
            Node::Stage(stage) => {
                println!(
                    "  [{}] stage {} provider={} model={} termination={} max_iterations={}",
                    stage.path,
                    stage.id,
                    stage.provider,
                    stage.model.as_deref().unwrap_or("(provider default)"),
                    stage.termination.type_name(),
                    stage.max_iterations,
                );
            }
            Node::Parallel(parallel) => {
                println!(
                    "  [{}] parallel {} providers={}",
                    parallel.path,
                    parallel.id,
                    parallel.providers.join(","),
                );
                for inner in &parallel.stages {
                    println!(
                        "    [{}] stage {} termination={}",
                        inner.path,
                        inner.id,
                        inner.termination.type_name(),
                    );
                }
            }
        }
    }

    // Preview the first stage's prompt with placeholder values visible.
    let first = plan.nodes.iter().find_map(|n| match n {
        Node::Stage(stage) => Some(stage),
        Node::Parallel(parallel) => parallel.stages.first(),
    });
    if let Some(stage) = first {
        let text = match (&stage.template, &stage.prompt) {
            (Some(template), _) => {
                let path = match crate::session::guard_within(
                    &config.templates_dir,
                    std::path::Path::new(&format!("{}.md", template)),
                ) {
                    Ok(path) => path,
                    Err(e) => {
                        eprintln!("{} {:#}", style("error:").red().bold(), e);
                        return Ok(EXIT_USER);
                    }
                };
                match std::fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(e) => {
                        eprintln!(
                            "{} template {}: {}",
                            style("error:").red().bold(),
                            path.display(),
                            e
                        );
                        return Ok(EXIT_USER);
                    }
                }
            }
            (None, Some(prompt)) => prompt.clone(),
            (None, None) => String::new(),
        };
        let mut vars = TemplateVars::new();
        vars.set("SESSION", &session)
            .set("ITERATION", "1")
            .set("INDEX", stage.index.to_string())
            .set("CONTEXT", plan.context.clone().unwrap_or_default());
        println!();
        println!("{} (stage {}, iteration 1)", style("prompt preview").cyan().bold(), stage.id);
        println!("{}", resolve(&text, &vars));
    }

    Ok(EXIT_OK)
}
