//! The runner: a single-writer state machine driving one run.
//!
//! All `RunState` and journal mutation happens here (or in dispatcher/router
//! code called from here); provider invocations are the only concurrent
//! tasks, and their completions re-enter this task's critical section one at
//! a time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use cascade_journal::{ExecutionJournal, MemoryStore};
use cascade_types::{
    CheckConfig, EngineEvent, EngineState, ExecutionResult, ExecutionStatistics, Issue,
    RunMetadata, Scope, Severity, WaveKind,
};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::{CheckMeta, EngineContext, EventSink, PrInfo, RunState};
use crate::dispatcher::{DispatchItem, LevelDispatcher};
use crate::error::EngineError;
use crate::evaluator::ConditionEvaluator;
use crate::planner::{WavePlan, plan_wave};
use crate::provider::ProviderRegistry;
use crate::resolver::{expand_subset, resolve};

/// One execution request against the configured workflow.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    /// Subset of configured check ids to run; the resolver expands the set
    /// transitively via `depends_on`. Empty means all.
    pub checks: Vec<String>,
    /// Trigger name; passed to providers and recorded on journal entries.
    pub event: String,
    pub pr: Option<PrInfo>,
    /// Opaque bag forwarded to providers and expression contexts.
    pub execution_context: Value,
    pub session_id: Option<String>,
    pub cancellation: Option<CancellationToken>,
}

impl ExecutionRequest {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            checks: Vec::new(),
            event: event.into(),
            pr: None,
            execution_context: Value::Null,
            session_id: None,
            cancellation: None,
        }
    }

    pub fn checks<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.checks = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// The workflow execution engine: holds the configured checks, the provider
/// registry, and the external collaborator seams. One `Engine` serves many
/// runs; per-run state lives in `execute`.
pub struct Engine {
    config: EngineConfig,
    checks: Vec<CheckConfig>,
    providers: ProviderRegistry,
    evaluator: Arc<dyn ConditionEvaluator>,
    memory: MemoryStore,
    sink: EventSink,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        checks: Vec<CheckConfig>,
        providers: ProviderRegistry,
        evaluator: Arc<dyn ConditionEvaluator>,
    ) -> Self {
        Self {
            config,
            checks,
            providers,
            evaluator,
            memory: MemoryStore::new(),
            sink: EventSink::disabled(),
        }
    }

    /// Forward every engine event to `tx` for frontends and telemetry.
    pub fn with_event_sink(mut self, tx: UnboundedSender<EngineEvent>) -> Self {
        self.sink = EventSink::new(tx);
        self
    }

    /// Share a memory store across engines (nested workflows).
    pub fn with_memory(mut self, memory: MemoryStore) -> Self {
        self.memory = memory;
        self
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Run the state machine to a terminal state and aggregate the result.
    ///
    /// Graph failures (cycle, undefined reference) complete the run with a
    /// single `system/error` issue and no dispatch; `Err` is reserved for
    /// caller mistakes.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        if self.checks.is_empty() {
            return Err(EngineError::NoChecks);
        }

        let started = Instant::now();
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut all: BTreeMap<String, CheckConfig> = BTreeMap::new();
        let mut full_order: Vec<String> = Vec::new();
        for check in &self.checks {
            if all.insert(check.id.clone(), check.clone()).is_none() {
                full_order.push(check.id.clone());
            }
        }
        let selected = expand_subset(&all, &request.checks)?;
        let order: Vec<String> = full_order
            .iter()
            .filter(|id| selected.contains(*id))
            .cloned()
            .collect();
        let checks: BTreeMap<String, CheckConfig> = all
            .into_iter()
            .filter(|(id, _)| selected.contains(id))
            .collect();
        let meta: BTreeMap<String, CheckMeta> = checks
            .values()
            .map(|check| {
                (
                    check.id.clone(),
                    CheckMeta {
                        check_type: check.check_type.clone(),
                        session: check.session.clone(),
                        fanout: check
                            .fanout
                            .unwrap_or_else(|| self.providers.default_fanout_for(&check.check_type)),
                    },
                )
            })
            .collect();

        let ctx = Arc::new(EngineContext {
            config: self.config.clone(),
            checks,
            order,
            meta,
            session_id: session_id.clone(),
            event: request.event.clone(),
            execution_context: request.execution_context.clone(),
            pr: request.pr.clone(),
            cancellation: request.cancellation.clone().unwrap_or_default(),
        });

        let mut journal = ExecutionJournal::new(&session_id);
        let mut state = RunState::new();
        info!(%session_id, event = %ctx.event, checks = ctx.order.len(), "run starting");

        // Init: build the dependency plan.
        match resolve(&ctx.checks, &ctx.order) {
            Ok(plan) => {
                state.reverse = plan.reverse.clone();
                self.sink.emit(EngineEvent::PlanBuilt {
                    levels: plan.levels.clone(),
                });
                state.transition(&self.sink, EngineState::PlanReady);
                state.level_queue = plan
                    .levels
                    .into_iter()
                    .filter(|level| !level.is_empty())
                    .collect();
                state.flags.wave_kind = WaveKind::Initial;
                state.transition(&self.sink, EngineState::WavePlanning);
            }
            Err(error) => {
                state.run_issues.push(Issue::new(
                    Severity::Critical,
                    "system/error",
                    error.to_string(),
                ));
                state.transition(&self.sink, EngineState::Completed);
            }
        }

        let dispatcher = LevelDispatcher {
            ctx: &ctx,
            registry: &self.providers,
            evaluator: &self.evaluator,
            memory: &self.memory,
            sink: &self.sink,
        };

        let mut pending: Vec<DispatchItem> = Vec::new();
        while !state.state.is_terminal() {
            match state.state {
                EngineState::WavePlanning => {
                    if ctx.cancellation.is_cancelled() {
                        state.run_issues.push(Issue::new(
                            Severity::Critical,
                            "system/error",
                            "execution cancelled",
                        ));
                        state.transition(&self.sink, EngineState::Error);
                        break;
                    }
                    match plan_wave(&mut state) {
                        WavePlan::Complete => {
                            state.transition(&self.sink, EngineState::Completed);
                        }
                        WavePlan::Dispatch { items, kind } => {
                            state.begin_wave(kind);
                            self.sink.emit(EngineEvent::WaveRequested {
                                wave: state.wave,
                                kind,
                            });
                            self.sink.emit(EngineEvent::LevelReady {
                                level: items.iter().map(|item| item.check_id.clone()).collect(),
                                wave: state.wave,
                            });
                            pending = items;
                            state.transition(&self.sink, EngineState::LevelDispatch);
                        }
                    }
                }
                EngineState::LevelDispatch => {
                    let items = std::mem::take(&mut pending);
                    dispatcher
                        .dispatch_level(&mut state, &mut journal, items)
                        .await;
                    state.transition(&self.sink, EngineState::WavePlanning);
                }
                // Terminal states break the loop; other states only occur
                // inside dispatch_level.
                _ => state.transition(&self.sink, EngineState::WavePlanning),
            }
        }

        let result = self.aggregate(&ctx, &state, &journal, started, session_id);
        let shutdown_error = match state.state {
            EngineState::Error => Some(
                state
                    .run_issues
                    .last()
                    .map(|issue| issue.message.clone())
                    .unwrap_or_else(|| "run failed".to_string()),
            ),
            _ => None,
        };
        info!(
            session_id = %result.metadata.session_id,
            waves = result.metadata.waves,
            state = %result.metadata.final_state,
            issues = result.issues.len(),
            "run finished"
        );
        self.sink.emit(EngineEvent::Shutdown {
            error: shutdown_error,
        });
        Ok(result)
    }

    /// Fold journal and state into the final `ExecutionResult`: run-level
    /// issues first, then each check's latest root-scope issues in
    /// configuration order.
    fn aggregate(
        &self,
        ctx: &EngineContext,
        state: &RunState,
        journal: &ExecutionJournal,
        started: Instant,
        session_id: String,
    ) -> ExecutionResult {
        let snapshot = journal.latest_snapshot();
        let mut issues: Vec<Issue> = state.run_issues.clone();
        for id in &ctx.order {
            if let Some(entry) = journal.get(id, &Scope::root(), snapshot) {
                issues.extend(entry.result.issues.iter().cloned());
            }
        }
        let checks = ctx
            .order
            .iter()
            .filter_map(|id| state.stats.get(id).cloned())
            .collect();

        ExecutionResult {
            issues,
            statistics: ExecutionStatistics { checks },
            metadata: RunMetadata {
                session_id,
                event: ctx.event.clone(),
                waves: state.wave,
                duration_ms: started.elapsed().as_millis() as u64,
                final_state: state.state,
            },
        }
    }
}
