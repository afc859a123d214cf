use crate::result::CheckResult;
use crate::scope::Scope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single entry in the append-only execution journal.
///
/// Multiple entries per `(check_id, scope)` are allowed; the latest wins for
/// point reads and the full series is exposed as history. `event` is the
/// trigger name the run was started with, so journal reads can be filtered
/// per trigger. Timestamp is wall-clock for observability only — ordering is
/// positional.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub session_id: String,
    pub check_id: String,
    pub scope: Scope,
    pub event: String,
    pub result: CheckResult,
    pub timestamp: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(
        session_id: impl Into<String>,
        check_id: impl Into<String>,
        scope: Scope,
        event: impl Into<String>,
        result: CheckResult,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            check_id: check_id.into(),
            scope,
            event: event.into(),
            result,
            timestamp: Utc::now(),
        }
    }
}
