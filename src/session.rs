//! Session directory layout and naming.
//!
//! Every session owns one directory tree under the runs root:
//!
//! ```text
//! runs/<session>/
//!   plan.json  state.json  events.jsonl  progress-<session>.md
//!   stage-NN-<id>/iterations/NNN/{context.json, output.md, result.json, ...}
//!   parallel-NN-<id>/{resume.json, manifest.json, providers/<p>/...}
//! ```
//!
//! Stage indices are 2-digit zero-padded, iterations 3-digit. Session names
//! are validated so a session can never write outside its own root.

use anyhow::{Result, bail};
use std::path::{Path, PathBuf};

/// Characters allowed in session names, stage ids, and provider names used
/// as directory components.
fn valid_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Validate a session name for use as a directory component.
pub fn validate_session_name(name: &str) -> Result<()> {
    if !valid_component(name) {
        bail!(
            "invalid session name '{}': use letters, digits, '-', '_' and '.'",
            name
        );
    }
    Ok(())
}

/// Resolver for every path a session owns.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    session: String,
    root: PathBuf,
    locks_root: PathBuf,
}

impl SessionPaths {
    pub fn new(runs_root: &Path, locks_root: &Path, session: &str) -> Result<Self> {
        validate_session_name(session)?;
        Ok(Self {
            session: session.to_string(),
            root: runs_root.join(session),
            locks_root: locks_root.to_path_buf(),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn session_dir(&self) -> &Path {
        &self.root
    }

    pub fn plan_path(&self) -> PathBuf {
        self.root.join("plan.json")
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.locks_root.join(format!("{}.lock", self.session))
    }

    /// Session-level progress file, kept for older tooling that watched it.
    pub fn legacy_progress_path(&self) -> PathBuf {
        self.root.join(format!("progress-{}.md", self.session))
    }

    pub fn stage_dir_name(index: usize, id: &str) -> String {
        format!("stage-{:02}-{}", index, id)
    }

    pub fn parallel_dir_name(index: usize, id: &str) -> String {
        format!("parallel-{:02}-{}", index, id)
    }

    pub fn iteration_dir_name(iteration: u32) -> String {
        format!("{:03}", iteration)
    }
}

/// Paths inside one stage directory. The `root` is either the session dir
/// or, inside a parallel block, a provider's isolated scope.
#[derive(Debug, Clone)]
pub struct StagePaths {
    dir: PathBuf,
}

impl StagePaths {
    pub fn new(root: &Path, index: usize, id: &str) -> Result<Self> {
        if !valid_component(id) {
            bail!("invalid stage id '{}'", id);
        }
        Ok(Self {
            dir: root.join(SessionPaths::stage_dir_name(index, id)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn progress_path(&self) -> PathBuf {
        self.dir.join("progress.md")
    }

    /// Stage-level output file: the latest iteration's output is mirrored
    /// here so downstream stages have a stable path to read.
    pub fn output_path(&self) -> PathBuf {
        self.dir.join("output.md")
    }

    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.dir
            .join("iterations")
            .join(SessionPaths::iteration_dir_name(iteration))
    }

    pub fn context_path(&self, iteration: u32) -> PathBuf {
        self.iteration_dir(iteration).join("context.json")
    }

    pub fn iteration_output_path(&self, iteration: u32) -> PathBuf {
        self.iteration_dir(iteration).join("output.md")
    }

    pub fn result_path(&self, iteration: u32) -> PathBuf {
        self.iteration_dir(iteration).join("result.json")
    }

    pub fn status_path(&self, iteration: u32) -> PathBuf {
        self.iteration_dir(iteration).join("status.json")
    }

    pub fn error_path(&self, iteration: u32) -> PathBuf {
        self.iteration_dir(iteration).join("error.json")
    }

    pub fn judge_path(&self, iteration: u32) -> PathBuf {
        self.iteration_dir(iteration).join("judge.json")
    }
}

/// Paths inside one parallel block directory.
#[derive(Debug, Clone)]
pub struct ParallelPaths {
    dir: PathBuf,
}

impl ParallelPaths {
    pub fn new(root: &Path, index: usize, id: &str) -> Result<Self> {
        if !valid_component(id) {
            bail!("invalid parallel block id '{}'", id);
        }
        Ok(Self {
            dir: root.join(SessionPaths::parallel_dir_name(index, id)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn resume_path(&self) -> PathBuf {
        self.dir.join("resume.json")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }

    /// A provider's isolated sub-root. Lays out exactly like a session dir.
    pub fn provider_scope(&self, provider: &str) -> Result<PathBuf> {
        if !valid_component(provider) {
            bail!("invalid provider name '{}'", provider);
        }
        Ok(self.dir.join("providers").join(provider))
    }

    /// Per-provider state snapshot, isolated from the session's own.
    pub fn provider_state_path(&self, provider: &str) -> Result<PathBuf> {
        Ok(self.provider_scope(provider)?.join("state.json"))
    }
}

/// Reject any relative path that ascends or any absolute path that escapes
/// the given root once joined.
pub fn guard_within(root: &Path, candidate: &Path) -> Result<PathBuf> {
    use std::path::Component;
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        bail!("path '{}' ascends via '..'", candidate.display());
    }
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    if !joined.starts_with(root) {
        bail!(
            "path '{}' escapes session root '{}'",
            candidate.display(),
            root.display()
        );
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> SessionPaths {
        SessionPaths::new(Path::new("/runs"), Path::new("/locks"), "alpha").unwrap()
    }

    #[test]
    fn session_name_validation() {
        assert!(validate_session_name("refactor-2026.01").is_ok());
        assert!(validate_session_name("").is_err());
        assert!(validate_session_name("..").is_err());
        assert!(validate_session_name("a/b").is_err());
        assert!(validate_session_name("a b").is_err());
    }

    #[test]
    fn layout_matches_convention() {
        let p = paths();
        assert_eq!(p.state_path(), Path::new("/runs/alpha/state.json"));
        assert_eq!(p.events_path(), Path::new("/runs/alpha/events.jsonl"));
        assert_eq!(p.lock_path(), Path::new("/locks/alpha.lock"));
        assert_eq!(
            p.legacy_progress_path(),
            Path::new("/runs/alpha/progress-alpha.md")
        );
    }

    #[test]
    fn stage_and_iteration_names_are_zero_padded() {
        assert_eq!(SessionPaths::stage_dir_name(0, "plan"), "stage-00-plan");
        assert_eq!(SessionPaths::stage_dir_name(12, "fix"), "stage-12-fix");
        assert_eq!(
            SessionPaths::parallel_dir_name(2, "impl"),
            "parallel-02-impl"
        );
        assert_eq!(SessionPaths::iteration_dir_name(7), "007");
        assert_eq!(SessionPaths::iteration_dir_name(123), "123");
    }

    #[test]
    fn stage_paths_nest_iterations() {
        let p = paths();
        let stage = StagePaths::new(p.session_dir(), 1, "plan").unwrap();
        assert_eq!(
            stage.context_path(3),
            Path::new("/runs/alpha/stage-01-plan/iterations/003/context.json")
        );
        assert_eq!(
            stage.result_path(3),
            Path::new("/runs/alpha/stage-01-plan/iterations/003/result.json")
        );
    }

    #[test]
    fn parallel_paths_isolate_providers() {
        let p = paths();
        let block = ParallelPaths::new(p.session_dir(), 2, "impl").unwrap();
        assert_eq!(
            block.provider_scope("claude").unwrap(),
            Path::new("/runs/alpha/parallel-02-impl/providers/claude")
        );
        assert!(block.provider_scope("../other").is_err());
    }

    #[test]
    fn guard_rejects_ascent_and_escape() {
        let root = Path::new("/runs/alpha");
        assert!(guard_within(root, Path::new("../beta/state.json")).is_err());
        assert!(guard_within(root, Path::new("/runs/beta/x")).is_err());
        let ok = guard_within(root, Path::new("stage-00-plan/output.md")).unwrap();
        assert_eq!(ok, Path::new("/runs/alpha/stage-00-plan/output.md"));
    }
}
