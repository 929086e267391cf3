//! The judge subroutine for judgment termination.
//!
//! Renders a judge prompt from a template, invokes a configured
//! lightweight provider, and normalizes its JSON answer (stripping any
//! fenced block) to `{stop, reason, confidence}`. Unparseable output is
//! retried once. Invocations emit `judge_start`/`judge_complete` events
//! and persist `judge.json` in the iteration directory.

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;

use super::PolicyContext;
use crate::events::{Event, EventType};
use crate::pipeline::JudgeConfig;
use crate::provider::ProviderRequest;
use crate::template::{TemplateVars, resolve};

/// Normalized judge answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub stop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Judge invocations are quick classifications, not work sessions.
const JUDGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs the judge for one stage.
#[derive(Debug, Clone)]
pub struct JudgeRunner {
    config: JudgeConfig,
}

impl JudgeRunner {
    pub fn new(config: JudgeConfig) -> Self {
        Self { config }
    }

    /// One judge pass: render, invoke, parse. Retries a single time when
    /// the output cannot be normalized.
    pub async fn run(&self, cx: &PolicyContext<'_>) -> Result<JudgeVerdict> {
        let template_path = crate::session::guard_within(
            cx.templates_dir,
            std::path::Path::new(&format!("{}.md", self.config.template)),
        )?;
        let template = std::fs::read_to_string(&template_path).with_context(|| {
            format!("failed to read judge template {}", template_path.display())
        })?;

        let mut vars = TemplateVars::new();
        vars.set("SESSION", cx.session)
            .set("ITERATION", cx.iteration.to_string())
            .set("INDEX", cx.stage.index.to_string())
            .set(
                "CTX",
                cx.stage_paths
                    .context_path(cx.iteration)
                    .to_string_lossy()
                    .into_owned(),
            )
            .set(
                "OUTPUT",
                cx.stage_paths
                    .iteration_output_path(cx.iteration)
                    .to_string_lossy()
                    .into_owned(),
            )
            .set(
                "RESULT",
                cx.stage_paths
                    .result_path(cx.iteration)
                    .to_string_lossy()
                    .into_owned(),
            )
            .set(
                "PROGRESS",
                cx.stage_paths.progress_path().to_string_lossy().into_owned(),
            );
        let prompt = resolve(&template, &vars);

        let provider_name = self
            .config
            .provider
            .as_deref()
            .unwrap_or(cx.stage.provider.as_str());
        let provider = cx.registry.resolve(provider_name)?;

        cx.events.append(
            &Event::new(EventType::JudgeStart, cx.session)
                .with_cursor(cx.cursor.clone())
                .with_data(json!({"provider": provider_name})),
        )?;

        let mut verdict = None;
        let mut last_error = None;
        for attempt in 0..2 {
            let mut request = ProviderRequest::new(prompt.clone(), cx.work_dir);
            request.model = self.config.model.clone();
            request.timeout = JUDGE_TIMEOUT;
            let outcome = provider.execute(cx.cancel, request).await?;
            if !outcome.succeeded() {
                last_error = Some(format!("judge exited with code {}", outcome.exit_code));
                continue;
            }
            match parse_judge_output(&outcome.output) {
                Ok(parsed) => {
                    verdict = Some(parsed);
                    break;
                }
                Err(e) => {
                    last_error = Some(format!("attempt {}: {}", attempt + 1, e));
                }
            }
        }

        let result = match verdict {
            Some(verdict) => {
                std::fs::write(
                    cx.stage_paths.judge_path(cx.iteration),
                    serde_json::to_string_pretty(&verdict)?,
                )
                .context("failed to write judge.json")?;
                Ok(verdict)
            }
            None => Err(anyhow::anyhow!(
                "judge output unusable: {}",
                last_error.unwrap_or_else(|| "no attempts ran".into())
            )),
        };

        cx.events.append(
            &Event::new(EventType::JudgeComplete, cx.session)
                .with_cursor(cx.cursor.clone())
                .with_data(match &result {
                    Ok(v) => json!({"stop": v.stop, "reason": v.reason}),
                    Err(e) => json!({"failed": true, "message": e.to_string()}),
                }),
        )?;

        result
    }
}

/// Normalize raw judge output: strip a fenced block if present, then parse
/// JSON accepting either `{stop: bool}` or `{decision: "stop"|"continue"}`.
pub fn parse_judge_output(raw: &str) -> Result<JudgeVerdict> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("constant regex pattern is valid")
    });

    let body = fence
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
        .trim();

    let value: serde_json::Value =
        serde_json::from_str(body).context("judge output is not JSON")?;

    let stop = match value.get("stop") {
        Some(serde_json::Value::Bool(b)) => *b,
        _ => match value.get("decision").and_then(|d| d.as_str()) {
            Some("stop") => true,
            Some("continue") => false,
            _ => bail!("judge JSON has neither a boolean 'stop' nor a 'decision'"),
        },
    };

    Ok(JudgeVerdict {
        stop,
        reason: value
            .get("reason")
            .and_then(|r| r.as_str())
            .map(str::to_string),
        confidence: value.get("confidence").and_then(|c| c.as_f64()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let verdict =
            parse_judge_output(r#"{"stop": true, "reason": "plateaued", "confidence": 0.9}"#)
                .unwrap();
        assert!(verdict.stop);
        assert_eq!(verdict.reason.as_deref(), Some("plateaued"));
        assert_eq!(verdict.confidence, Some(0.9));
    }

    #[test]
    fn strips_fenced_blocks() {
        let raw = "Here is my verdict:\n```json\n{\"stop\": false}\n```\nthanks";
        let verdict = parse_judge_output(raw).unwrap();
        assert!(!verdict.stop);
    }

    #[test]
    fn accepts_decision_form() {
        let verdict = parse_judge_output(r#"{"decision": "stop"}"#).unwrap();
        assert!(verdict.stop);
        let verdict = parse_judge_output(r#"{"decision": "continue"}"#).unwrap();
        assert!(!verdict.stop);
    }

    #[test]
    fn rejects_non_json_and_shapeless_json() {
        assert!(parse_judge_output("I think you should stop").is_err());
        assert!(parse_judge_output(r#"{"verdict": "yes"}"#).is_err());
    }
}
