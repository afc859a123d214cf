use crate::result::CheckResult;
use crate::scope::Scope;
use crate::state::EngineState;
use serde::{Deserialize, Serialize};

/// Which routing mechanism requested a forward run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardOrigin {
    Run,
    RunJs,
    Goto,
    GotoJs,
    Retry,
}

impl ForwardOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::RunJs => "run_js",
            Self::Goto => "goto",
            Self::GotoJs => "goto_js",
            Self::Retry => "retry",
        }
    }
}

/// What caused the current wave to be planned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveKind {
    #[default]
    Initial,
    Forward,
    Retry,
}

/// Events emitted on the engine's bus.
///
/// The runner consumes `ForwardRunRequested` and `WaveRetry` internally to
/// plan waves; every variant is also forwarded to subscribed frontends and
/// telemetry consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Dependency graph resolved into topological levels.
    PlanBuilt { levels: Vec<Vec<String>> },
    /// The planner opened a new wave.
    WaveRequested { wave: u64, kind: WaveKind },
    /// A level (natural or synthetic) is about to dispatch.
    LevelReady { level: Vec<String>, wave: u64 },
    /// All checks of the level reached a terminal outcome.
    LevelDepleted { level: Vec<String>, wave: u64 },
    /// A provider invocation was scheduled.
    CheckScheduled { check_id: String, scope: Scope },
    /// A check reached a terminal outcome (including skips).
    CheckCompleted {
        check_id: String,
        scope: Scope,
        result: CheckResult,
    },
    /// A check's task failed outside the provider contract (panic, join error).
    CheckErrored {
        check_id: String,
        scope: Scope,
        error: String,
    },
    /// Routing asked for a check to run outside its natural level.
    ForwardRunRequested {
        target: String,
        scope: Scope,
        origin: ForwardOrigin,
        goto_event: Option<String>,
        /// Advisory backoff delay for retry-origin requests.
        delay_ms: Option<u64>,
    },
    /// Routing asked the planner to open another wave.
    WaveRetry { reason: String },
    /// The runner moved between states.
    StateTransition { from: EngineState, to: EngineState },
    /// The run ended; `error` is set when it ended in `Error`.
    Shutdown { error: Option<String> },
}

impl EngineEvent {
    /// The variant name as a static string for logging and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlanBuilt { .. } => "PlanBuilt",
            Self::WaveRequested { .. } => "WaveRequested",
            Self::LevelReady { .. } => "LevelReady",
            Self::LevelDepleted { .. } => "LevelDepleted",
            Self::CheckScheduled { .. } => "CheckScheduled",
            Self::CheckCompleted { .. } => "CheckCompleted",
            Self::CheckErrored { .. } => "CheckErrored",
            Self::ForwardRunRequested { .. } => "ForwardRunRequested",
            Self::WaveRetry { .. } => "WaveRetry",
            Self::StateTransition { .. } => "StateTransition",
            Self::Shutdown { .. } => "Shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_variants() {
        let event = EngineEvent::ForwardRunRequested {
            target: "deploy".into(),
            scope: Scope::root(),
            origin: ForwardOrigin::Goto,
            goto_event: None,
            delay_ms: None,
        };
        assert_eq!(event.name(), "ForwardRunRequested");
        assert_eq!(
            EngineEvent::WaveRetry {
                reason: "forward run".into()
            }
            .name(),
            "WaveRetry"
        );
    }

    #[test]
    fn forward_origin_wire_names() {
        assert_eq!(ForwardOrigin::RunJs.as_str(), "run_js");
        assert_eq!(ForwardOrigin::GotoJs.as_str(), "goto_js");
        assert_eq!(ForwardOrigin::Retry.as_str(), "retry");
    }
}
