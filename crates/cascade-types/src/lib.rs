pub mod check;
pub mod error;
pub mod event;
pub mod issue;
pub mod journal;
pub mod result;
pub mod scope;
pub mod state;
pub mod stats;

pub use check::{
    BackoffMode, BackoffPolicy, CheckConfig, FanoutMode, InitBlock, RetryPolicy, RoutingBlock,
    SchemaSpec, TransitionRule,
};
pub use error::DomainError;
pub use event::{EngineEvent, ForwardOrigin, WaveKind};
pub use issue::{GLOBAL_FAIL_IF, Issue, Severity, is_fatal_rule_id};
pub use journal::JournalEntry;
pub use result::{CheckResult, FAILED_MARKER, SkipReason};
pub use scope::{MAX_FANOUT_DEPTH, Scope, ScopeSegment};
pub use state::EngineState;
pub use stats::{CheckStats, ExecutionResult, ExecutionStatistics, RunMetadata, SeverityCounts};
