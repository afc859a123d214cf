use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use cascade_types::{
    CheckConfig, CheckStats, EngineEvent, EngineState, FanoutMode, ForwardOrigin, Issue, Scope,
    WaveKind,
};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::EngineConfig;

/// Pull-request context forwarded into condition-expression scopes.
#[derive(Clone, Debug, Default)]
pub struct PrInfo {
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub files_changed: Vec<String>,
}

/// Cached per-check metadata derived once at run start.
#[derive(Clone, Debug)]
pub struct CheckMeta {
    pub check_type: String,
    pub session: Option<String>,
    /// Effective fanout: explicit config, else the provider's preference.
    pub fanout: FanoutMode,
}

/// Immutable per-run configuration. Born at `Init`, dies with the run.
#[derive(Clone, Debug)]
pub struct EngineContext {
    pub config: EngineConfig,
    /// The selected checks for this run, keyed by id.
    pub checks: BTreeMap<String, CheckConfig>,
    /// Selected check ids in configuration order.
    pub order: Vec<String>,
    pub meta: BTreeMap<String, CheckMeta>,
    pub session_id: String,
    /// Trigger name the run was started with.
    pub event: String,
    /// Opaque pass-through to providers: auth clients, webhook payloads,
    /// parent-scope links for nested workflows.
    pub execution_context: Value,
    pub pr: Option<PrInfo>,
    pub cancellation: CancellationToken,
}

impl EngineContext {
    pub fn check(&self, id: &str) -> Option<&CheckConfig> {
        self.checks.get(id)
    }

    pub fn fanout_of(&self, id: &str) -> FanoutMode {
        self.meta
            .get(id)
            .map(|meta| meta.fanout)
            .unwrap_or(FanoutMode::Map)
    }

    pub fn session_of(&self, id: &str) -> Option<&str> {
        self.meta.get(id).and_then(|meta| meta.session.as_deref())
    }

    pub fn timeout_ms(&self, check: &CheckConfig) -> u64 {
        check.timeout_ms.unwrap_or(self.config.default_timeout_ms)
    }
}

/// Mutable flags consulted across planner, dispatcher, and router.
#[derive(Clone, Debug, Default)]
pub struct RunFlags {
    pub fail_fast_triggered: bool,
    pub forward_run_requested: bool,
    pub forward_run_active: bool,
    pub wave_kind: WaveKind,
    pub awaiting_human_input: bool,
    /// A `WaveRetry` asked for guards to be re-evaluated once the forward
    /// queue drains.
    pub guard_retry_pending: bool,
}

/// A queued routing-induced dispatch, drained by the planner into synthetic
/// waves.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardRun {
    pub target: String,
    pub scope: Scope,
    pub origin: ForwardOrigin,
    pub event_override: Option<String>,
    pub delay_ms: Option<u64>,
}

/// Mutable per-run state. All mutation happens on the runner task.
///
/// Each field tracks just enough bookkeeping for the next planning or
/// routing decision without rescanning the journal.
#[derive(Debug, Default)]
pub struct RunState {
    pub state: EngineState,
    /// Completed wave count; incremented when the planner opens a wave.
    pub wave: u64,
    /// Remaining natural levels from the resolved plan.
    pub level_queue: VecDeque<Vec<String>>,
    /// Internal FIFO of routing decisions awaiting the planner.
    pub event_queue: VecDeque<EngineEvent>,
    pub active_dispatches: usize,
    /// Checks with any committed entry this run (skips included).
    pub completed_checks: HashSet<String>,
    /// Checks committed during the current wave; cleared per wave.
    pub current_wave_completions: HashSet<String>,
    /// Checks whose latest outcome is a fatal failure or gating skip that
    /// dependents must treat as unsatisfied.
    pub failed_checks: HashSet<String>,
    /// Monotonically non-decreasing count of forward-run emissions.
    pub routing_loop_count: u32,
    pub retry_attempts: HashMap<(String, Scope), u32>,
    /// Dedup keys `(trigger:check:wave)` so a check requests at most one
    /// wave retry per originating wave.
    pub forward_run_guards: HashSet<String>,
    /// Created lazily on first reference; never deleted.
    pub stats: BTreeMap<String, CheckStats>,
    /// Run-level issues (graph failures, cancellation) outside any check.
    pub run_issues: Vec<Issue>,
    /// forEach parents whose `on_finish` waits for all map dependents.
    pub deferred_on_finish: BTreeSet<String>,
    /// Reverse adjacency from the resolved plan (dependency -> dependents).
    pub reverse: BTreeMap<String, Vec<String>>,
    pub flags: RunFlags,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats_mut(&mut self, check_id: &str) -> &mut CheckStats {
        self.stats
            .entry(check_id.to_string())
            .or_insert_with(|| CheckStats::new(check_id))
    }

    /// Open a new wave: bump the counter, reset per-wave completions.
    pub fn begin_wave(&mut self, kind: WaveKind) {
        self.wave += 1;
        self.current_wave_completions.clear();
        self.flags.wave_kind = kind;
        self.flags.forward_run_active = matches!(kind, WaveKind::Forward);
    }

    /// Record a committed outcome for `check_id` in the current wave.
    pub fn record_completion(&mut self, check_id: &str) {
        self.completed_checks.insert(check_id.to_string());
        self.current_wave_completions.insert(check_id.to_string());
    }

    /// Move the state machine and notify observers. Idempotent for
    /// same-state calls.
    pub fn transition(&mut self, sink: &EventSink, to: EngineState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        debug!(%from, %to, "state transition");
        sink.emit(EngineEvent::StateTransition { from, to });
    }
}

/// Outbound fan-out of engine events to frontends and telemetry.
///
/// Send failures are ignored: a disconnected consumer must never affect the
/// run.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<EngineEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: EngineEvent) {
        debug!(event = event.name(), "engine event");
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
