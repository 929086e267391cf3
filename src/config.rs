//! Runtime configuration.
//!
//! Bridges the optional `.conductor/conductor.toml` project file with CLI
//! flags and environment variables into one `Config` the commands consume.
//! Override precedence for provider/model/context, highest first:
//! CLI flag, `PIPELINE_PROVIDER` / `PIPELINE_MODEL` / `PIPELINE_CONTEXT`,
//! stage config, pipeline config, provider default.
//!
//! # Configuration File Format
//!
//! ```toml
//! provider = "claude"
//! model = "sonnet"
//! provider_timeout_seconds = 900
//! strict_hooks = false
//!
//! [providers]
//! claude_cmd = "claude"
//! codex_cmd = "codex"
//!
//! [commands]
//! test = "cargo test"
//! ```

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::pipeline::Overrides;
use crate::provider::{
    ClaudeProvider, CodexProvider, DEFAULT_PROVIDER_TIMEOUT, ProviderRegistry,
};

pub const ENV_PROVIDER: &str = "PIPELINE_PROVIDER";
pub const ENV_MODEL: &str = "PIPELINE_MODEL";
pub const ENV_CONTEXT: &str = "PIPELINE_CONTEXT";

/// Parsed `.conductor/conductor.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectToml {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub strict_hooks: bool,
    /// Session trees live here instead of `.conductor/runs`; `~` expands
    /// to the home directory.
    #[serde(default)]
    pub runs_root: Option<String>,
    #[serde(default)]
    pub providers: ProviderCommands,
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCommands {
    #[serde(default)]
    pub claude_cmd: Option<String>,
    #[serde(default)]
    pub codex_cmd: Option<String>,
}

impl ProjectToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// Values collected from CLI flags, before env layering.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub context: Option<String>,
    pub commands: BTreeMap<String, String>,
    pub inputs: Vec<PathBuf>,
    pub runs: Option<u32>,
    pub max_iterations: Option<u32>,
}

/// Everything the commands need to find and run sessions.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub loops_dir: PathBuf,
    pub pipelines_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub runs_root: PathBuf,
    pub locks_root: PathBuf,
    pub verbose: bool,
    pub toml: ProjectToml,
}

impl Config {
    pub fn new(project_dir: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let project_dir = match project_dir {
            Some(dir) => dir,
            None => std::env::current_dir().context("failed to resolve current directory")?,
        };
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("failed to resolve project dir {}", project_dir.display()))?;

        let conductor_dir = project_dir.join(".conductor");
        let toml_path = conductor_dir.join("conductor.toml");
        let toml = if toml_path.exists() {
            ProjectToml::load(&toml_path)?
        } else {
            ProjectToml::default()
        };

        let runs_base = toml
            .runs_root
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| conductor_dir.clone());
        Ok(Self {
            loops_dir: conductor_dir.join("loops"),
            pipelines_dir: conductor_dir.join("pipelines"),
            templates_dir: conductor_dir.join("templates"),
            runs_root: runs_base.join("runs"),
            locks_root: runs_base.join("locks"),
            project_dir,
            conductor_dir,
            verbose,
            toml,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.conductor_dir,
            &self.loops_dir,
            &self.pipelines_dir,
            &self.templates_dir,
            &self.runs_root,
            &self.locks_root,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            runs_root: self.runs_root.clone(),
            locks_root: self.locks_root.clone(),
            project_dir: self.project_dir.clone(),
            templates_dir: self.templates_dir.clone(),
            provider_timeout: self
                .toml
                .provider_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_PROVIDER_TIMEOUT),
            strict_hooks: self.toml.strict_hooks,
        }
    }

    /// Registry honoring configured provider commands.
    pub fn build_registry(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        let claude = self
            .toml
            .providers
            .claude_cmd
            .clone()
            .unwrap_or_else(|| "claude".to_string());
        let codex = self
            .toml
            .providers
            .codex_cmd
            .clone()
            .unwrap_or_else(|| "codex".to_string());
        let _ = registry.register(std::sync::Arc::new(ClaudeProvider::new(claude)));
        let _ = registry.register(std::sync::Arc::new(CodexProvider::new(codex)));
        registry
    }

    /// Locate a loop definition by name.
    pub fn find_loop(&self, name: &str) -> Result<PathBuf> {
        for candidate in [
            self.loops_dir.join(format!("{}.yaml", name)),
            self.loops_dir.join(format!("{}.yml", name)),
        ] {
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(anyhow!(
            "no loop named '{}' (looked in {})",
            name,
            self.loops_dir.display()
        ))
    }

    /// Locate a pipeline: a YAML path as given, or a name under
    /// `.conductor/pipelines/`.
    pub fn find_pipeline(&self, name_or_path: &str) -> Result<PathBuf> {
        let direct = PathBuf::from(name_or_path);
        if direct.exists() {
            return Ok(direct);
        }
        for candidate in [
            self.pipelines_dir.join(format!("{}.yaml", name_or_path)),
            self.pipelines_dir.join(format!("{}.yml", name_or_path)),
        ] {
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(anyhow!(
            "no pipeline '{}' (not a file, and not under {})",
            name_or_path,
            self.pipelines_dir.display()
        ))
    }

    /// Layer CLI flags over the `PIPELINE_*` environment.
    pub fn overrides(&self, cli: &CliOverrides) -> Overrides {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let mut commands = self.toml.commands.clone();
        commands.extend(cli.commands.clone());
        Overrides {
            provider: cli.provider.clone().or_else(|| env(ENV_PROVIDER)),
            model: cli.model.clone().or_else(|| env(ENV_MODEL)),
            context: cli.context.clone().or_else(|| env(ENV_CONTEXT)),
            commands,
            initial_inputs: cli.inputs.clone(),
            runs: cli.runs,
            max_iterations: cli.max_iterations,
        }
    }

    /// Project-level provider/model defaults applied beneath pipeline
    /// config.
    pub fn default_provider(&self) -> Option<&str> {
        self.toml.provider.as_deref()
    }

    pub fn default_model(&self) -> Option<&str> {
        self.toml.model.as_deref()
    }
}

/// Expand a leading `~` against the home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
