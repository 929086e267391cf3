//! Prompt template resolution.
//!
//! Substitution is plain textual replacement of a fixed `{{NAME}}` set; no
//! shell or expression evaluation. Unknown placeholders stay verbatim and
//! everything outside a recognized placeholder is preserved byte-for-byte.
//! Missing values substitute the empty string.

use std::collections::BTreeMap;

/// The recognized placeholder names. `SESSION_NAME` aliases `SESSION` and
/// `PROGRESS_FILE` aliases `PROGRESS`.
pub const PLACEHOLDERS: &[&str] = &[
    "CTX",
    "STATUS",
    "RESULT",
    "PROGRESS",
    "OUTPUT",
    "SESSION",
    "SESSION_NAME",
    "ITERATION",
    "INDEX",
    "PERSPECTIVE",
    "OUTPUT_PATH",
    "PROGRESS_FILE",
    "CONTEXT",
];

/// Values for one render. Unset names resolve to the empty string.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: BTreeMap<&'static str, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a placeholder value. Unknown names are ignored, so callers can't
    /// silently widen the substitution set. Aliases store under their
    /// canonical name.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        let name = match name {
            "SESSION_NAME" => "SESSION",
            "PROGRESS_FILE" => "PROGRESS",
            other => other,
        };
        if let Some(key) = PLACEHOLDERS.iter().find(|p| **p == name) {
            self.values.insert(key, value.into());
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = match name {
            "SESSION_NAME" => "SESSION",
            "PROGRESS_FILE" => "PROGRESS",
            other => other,
        };
        self.values.get(name).map(String::as_str)
    }
}

/// Replace every recognized `{{NAME}}` occurrence in `text`.
pub fn resolve(text: &str, vars: &TemplateVars) -> String {
    let mut out = text.to_string();
    for name in PLACEHOLDERS {
        let needle = format!("{{{{{}}}}}", name);
        if !out.contains(&needle) {
            continue;
        }
        let value = vars.get(name).unwrap_or("");
        out = out.replace(&needle, value);
    }
    out
}
