//! The agent self-report (`result.json`).
//!
//! After every invocation the agent is expected to write a structured
//! result file in its iteration directory. The `decision` field is the only
//! required one; it carries the termination hint the policies consume.
//! Free-form stdout is never scraped for control signals.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::ErrorKind;

/// The agent's verdict on whether the stage should keep iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Continue,
    Stop,
    Error,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Continue => "continue",
            Decision::Stop => "stop",
            Decision::Error => "error",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Optional record of what the agent accomplished this iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_completed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_touched: Option<Vec<String>>,
}

/// Optional verification block: a command the agent ran and its outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifyBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// The parsed `result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work: Option<WorkRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifyBlock>,
    /// Hint that the agent believes progress has plateaued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plateau: Option<bool>,
    /// Set only on reports the engine synthesizes for failed iterations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,
}

impl AgentReport {
    /// A report the engine fabricates when the agent failed to produce one,
    /// or produced one that could not be parsed.
    pub fn synthesized_error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            decision: Decision::Error,
            summary: Some(message.into()),
            work: None,
            verify: None,
            plateau: None,
            error_type: Some(kind),
        }
    }

    pub fn is_error(&self) -> bool {
        self.decision == Decision::Error
    }
}

/// Outcome of looking for `result.json` in an iteration directory.
#[derive(Debug)]
pub enum LoadedReport {
    /// The file existed and parsed.
    Valid(AgentReport),
    /// The file did not exist.
    Missing,
    /// The file existed but was not a valid report. The raw text is
    /// retained so the iteration's `error.json` can embed it.
    Invalid { message: String, raw: String },
}

/// Read and validate `result.json` from an iteration directory.
pub fn load_report(path: &Path) -> Result<LoadedReport> {
    if !path.exists() {
        return Ok(LoadedReport::Missing);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read result file {}", path.display()))?;
    match serde_json::from_str::<AgentReport>(&raw) {
        Ok(report) => Ok(LoadedReport::Valid(report)),
        Err(e) => Ok(LoadedReport::Invalid {
            message: e.to_string(),
            raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn minimal_report_needs_only_decision() {
        let report: AgentReport = serde_json::from_str(r#"{"decision":"continue"}"#).unwrap();
        assert_eq!(report.decision, Decision::Continue);
        assert!(report.summary.is_none());
        assert!(!report.is_error());
    }

    #[test]
    fn full_report_round_trips() {
        let report = AgentReport {
            decision: Decision::Stop,
            summary: Some("converged".into()),
            work: Some(WorkRecord {
                items_completed: Some(4),
                files_touched: Some(vec!["src/lib.rs".into()]),
            }),
            verify: Some(VerifyBlock {
                command: Some("cargo test".into()),
                passed: Some(true),
                details: None,
            }),
            plateau: Some(true),
            error_type: None,
        };
        let json = serde_json::to_string(&report).unwrap();
        let parsed: AgentReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn unknown_decision_is_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("result.json");
        std::fs::write(&path, r#"{"decision":"maybe"}"#).unwrap();
        match load_report(&path).unwrap() {
            LoadedReport::Invalid { raw, .. } => assert!(raw.contains("maybe")),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn missing_file_is_reported_as_missing() {
        let dir = tempdir().unwrap();
        match load_report(&dir.path().join("result.json")).unwrap() {
            LoadedReport::Missing => {}
            other => panic!("expected Missing, got {:?}", other),
        }
    }

    #[test]
    fn synthesized_error_report_carries_kind() {
        let report = AgentReport::synthesized_error(ErrorKind::ResultMissing, "no result.json");
        assert!(report.is_error());
        assert_eq!(report.error_type, Some(ErrorKind::ResultMissing));
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("result_missing"));
    }
}
