use serde::{Deserialize, Serialize};
use std::fmt;

/// States of the runner's execution state machine.
///
/// Transitions: `Init → PlanReady → WavePlanning → LevelDispatch →
/// CheckRunning → Routing → (WavePlanning | Completed | Error)`.
/// `Completed` and `Error` are terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    #[default]
    Init,
    PlanReady,
    WavePlanning,
    LevelDispatch,
    CheckRunning,
    Routing,
    Completed,
    Error,
}

impl EngineState {
    /// Whether the run has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "Init",
            Self::PlanReady => "PlanReady",
            Self::WavePlanning => "WavePlanning",
            Self::LevelDispatch => "LevelDispatch",
            Self::CheckRunning => "CheckRunning",
            Self::Routing => "Routing",
            Self::Completed => "Completed",
            Self::Error => "Error",
        };
        write!(f, "{name}")
    }
}
