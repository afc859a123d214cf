use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved rule id for the run-level `fail_if` predicate.
///
/// Deliberately excluded from the `_fail_if` suffix rule in
/// [`is_fatal_rule_id`]; the router handles it explicitly so that a global
/// policy violation still flips routing without being misclassified as a
/// per-check execution failure.
pub const GLOBAL_FAIL_IF: &str = "global_fail_if";

/// Severity of a single issue. Ordering is `Info < Warning < Error < Critical`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single finding or failure produced by a check.
///
/// Whether an issue is a *finding* (reported, no control-flow effect) or a
/// *fatal failure* (flips routing, cascades skips) is decided purely by its
/// `rule_id` via [`is_fatal_rule_id`], never by severity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub rule_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Issue {
    pub fn new(severity: Severity, rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            rule_id: rule_id.into(),
            message: message.into(),
            file: None,
            line: None,
            category: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Whether this issue represents an execution failure rather than a finding.
    pub fn is_fatal(&self) -> bool {
        is_fatal_rule_id(&self.rule_id)
    }
}

/// Classify a rule id as fatal (an execution failure, not a finding).
///
/// Fatal patterns:
/// - suffix `/error` (e.g. `system/error`, `lint/error`)
/// - substring `/execution_error` (e.g. `build/execution_error`, `forEach/execution_error`)
/// - suffix `_fail_if`, excluding the reserved [`GLOBAL_FAIL_IF`]
pub fn is_fatal_rule_id(rule_id: &str) -> bool {
    if rule_id.ends_with("/error") || rule_id.contains("/execution_error") {
        return true;
    }
    rule_id.ends_with("_fail_if") && rule_id != GLOBAL_FAIL_IF
}
