use crate::issue::{Issue, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Key set on a forEach item output when that iteration failed.
///
/// Retry routing re-dispatches only iterations whose output carries this
/// marker; successful iterations keep their original output untouched.
pub const FAILED_MARKER: &str = "__failed";

/// Why a check was skipped instead of dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    IfCondition,
    Assume,
    DependencyFailed,
    ForEachEmpty,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IfCondition => "if_condition",
            Self::Assume => "assume",
            Self::DependencyFailed => "dependency_failed",
            Self::ForEachEmpty => "forEach_empty",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one check invocation (or one aggregated forEach pass).
///
/// `output` is the structured value successors consume; `content` is rendered
/// text for frontends. The forEach fields are only populated on aggregates
/// (`is_for_each = true`): `for_each_items` holds per-iteration outputs and
/// `for_each_item_results` the per-iteration summaries, index-aligned.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_for_each: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each_items: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each_item_results: Option<Vec<CheckResult>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub awaiting_human_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl CheckResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    /// Empty result recording a skip, carrying the informational
    /// `<check>/__skipped` issue.
    pub fn skipped(check_id: &str, reason: SkipReason) -> Self {
        Self {
            issues: vec![
                Issue::new(
                    Severity::Info,
                    format!("{check_id}/__skipped"),
                    format!("check skipped: {reason}"),
                )
                .with_category("skip"),
            ],
            skip_reason: Some(reason),
            ..Self::default()
        }
    }

    /// Result carrying a single fatal issue under `rule_id`.
    pub fn fatal(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![Issue::new(Severity::Critical, rule_id, message)],
            ..Self::default()
        }
    }

    pub fn push_issue(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    /// Whether any issue is an execution failure per its rule id.
    pub fn is_failed(&self) -> bool {
        self.issues.iter().any(Issue::is_fatal)
    }

    /// Whether this result records a skip rather than an execution.
    pub fn is_skipped(&self) -> bool {
        self.skip_reason.is_some()
    }

    /// Indices of failed iterations in an aggregated forEach result.
    ///
    /// An iteration counts as failed when its summary carries a fatal issue
    /// or its output object is marked with [`FAILED_MARKER`].
    pub fn failed_item_indices(&self) -> Vec<usize> {
        let Some(items) = &self.for_each_items else {
            return Vec::new();
        };
        let summaries = self.for_each_item_results.as_deref().unwrap_or(&[]);
        items
            .iter()
            .enumerate()
            .filter(|(i, item)| {
                let marked = item
                    .as_object()
                    .is_some_and(|obj| obj.get(FAILED_MARKER).is_some());
                let summary_failed = summaries.get(*i).is_some_and(CheckResult::is_failed);
                marked || summary_failed
            })
            .map(|(i, _)| i)
            .collect()
    }
}
