use crate::issue::{Issue, Severity};
use crate::result::SkipReason;
use crate::state::EngineState;
use serde::{Deserialize, Serialize};

/// Issue counts bucketed by severity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub info: u32,
    pub warning: u32,
    pub error: u32,
    pub critical: u32,
}

impl SeverityCounts {
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Info => self.info += 1,
            Severity::Warning => self.warning += 1,
            Severity::Error => self.error += 1,
            Severity::Critical => self.critical += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.info + self.warning + self.error + self.critical
    }
}

/// Per-check execution statistics, created lazily on first reference and
/// updated in place for the lifetime of the run.
///
/// Invariant: `total_runs == successful_runs + failed_runs`; a skipped check
/// has `total_runs == 0` until a later wave actually executes it, at which
/// point the skip is cleared.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckStats {
    pub name: String,
    pub total_runs: u32,
    pub successful_runs: u32,
    pub failed_runs: u32,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub issues_found: u32,
    pub issues_by_severity: SeverityCounts,
    pub total_duration_ms: u64,
    pub outputs_produced: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_iteration_duration_ms: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each_preview: Option<Vec<String>>,
    pub retry_attempts: u32,
}

impl CheckStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Record one provider invocation. Clears any earlier skip: a check that
    /// executes in a later wave is no longer considered skipped.
    pub fn record_run(&mut self, success: bool, duration_ms: u64) {
        self.total_runs += 1;
        if success {
            self.successful_runs += 1;
        } else {
            self.failed_runs += 1;
        }
        self.total_duration_ms += duration_ms;
        self.skipped = false;
        self.skip_reason = None;
    }

    pub fn record_skip(&mut self, reason: SkipReason) {
        self.skipped = true;
        self.skip_reason = Some(reason);
    }

    pub fn record_issues(&mut self, issues: &[Issue]) {
        for issue in issues {
            self.issues_found += 1;
            self.issues_by_severity.record(issue.severity);
        }
    }
}

/// Statistics for every check referenced during a run, in configuration order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub checks: Vec<CheckStats>,
}

impl ExecutionStatistics {
    pub fn get(&self, name: &str) -> Option<&CheckStats> {
        self.checks.iter().find(|stats| stats.name == name)
    }
}

/// Compact metadata describing a finished run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub session_id: String,
    pub event: String,
    pub waves: u64,
    pub duration_ms: u64,
    pub final_state: EngineState,
}

/// The outcome of a run: every surfaced issue, per-check statistics, and run
/// metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub issues: Vec<Issue>,
    pub statistics: ExecutionStatistics,
    pub metadata: RunMetadata,
}

impl ExecutionResult {
    /// Issues classified as execution failures.
    pub fn fatal_issues(&self) -> Vec<&Issue> {
        self.issues.iter().filter(|i| i.is_fatal()).collect()
    }
}
