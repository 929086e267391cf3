//! Definition validation — `lint [loop|pipeline] [name]`.

use anyhow::Result;
use console::style;
use std::path::Path;

use crate::cmd::{EXIT_OK, EXIT_USER};
use crate::config::Config;
use crate::pipeline::{PipelineDef, lint};

/// What to lint: one definition, or every definition of one kind, or all.
pub fn cmd_lint(config: &Config, kind: Option<&str>, name: Option<&str>) -> Result<u8> {
    let mut targets: Vec<(String, std::path::PathBuf, bool)> = Vec::new(); // (label, path, is_loop)

    match (kind, name) {
        (Some("loop"), Some(name)) => {
            let path = match config.find_loop(name) {
                Ok(path) => path,
                Err(e) => {
                    eprintln!("{} {:#}", style("error:").red().bold(), e);
                    return Ok(EXIT_USER);
                }
            };
            targets.push((format!("loop {}", name), path, true));
        }
        (Some("pipeline"), Some(name)) => {
            let path = match config.find_pipeline(name) {
                Ok(path) => path,
                Err(e) => {
                    eprintln!("{} {:#}", style("error:").red().bold(), e);
                    return Ok(EXIT_USER);
                }
            };
            targets.push((format!("pipeline {}", name), path, false));
        }
        (Some(other), _) if other != "loop" && other != "pipeline" => {
            eprintln!(
                "{} lint expects 'loop' or 'pipeline', got '{}'",
                style("error:").red().bold(),
                other
            );
            return Ok(EXIT_USER);
        }
        _ => {
            collect_yaml(&config.loops_dir, true, &mut targets)?;
            collect_yaml(&config.pipelines_dir, false, &mut targets)?;
        }
    }

    if targets.is_empty() {
        println!("nothing to lint");
        return Ok(EXIT_OK);
    }

    let mut failures = 0usize;
    for (label, path, is_loop) in &targets {
        let def = load_def(path, *is_loop);
        match def {
            Ok(def) => {
                let issues = lint(&def);
                if issues.is_empty() {
                    println!("{} {}", style("ok").green(), label);
                } else {
                    failures += 1;
                    println!("{} {}", style("fail").red().bold(), label);
                    for issue in issues {
                        println!("    {}", issue);
                    }
                }
            }
            Err(e) => {
                failures += 1;
                println!("{} {}", style("fail").red().bold(), label);
                println!("    {:#}", e);
            }
        }
    }

    Ok(if failures == 0 { EXIT_OK } else { EXIT_USER })
}

pub(crate) fn load_def(path: &Path, is_loop: bool) -> Result<PipelineDef> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if is_loop {
        PipelineDef::from_loop(path, &stem)
    } else {
        PipelineDef::load(path)
    }
}

fn collect_yaml(
    dir: &Path,
    is_loop: bool,
    targets: &mut Vec<(String, std::path::PathBuf, bool)>,
) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let kind = if is_loop { "loop" } else { "pipeline" };
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    entries.sort();
    for path in entries {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        targets.push((format!("{} {}", kind, stem), path, is_loop));
    }
    Ok(())
}
