//! Level dispatch: executes one topological level (or synthetic forward
//! wave) with bounded parallelism.
//!
//! Gating (`if`, `assume`, dependency satisfaction) happens serially on the
//! runner task with journal access; provider invocations run as spawned
//! tasks bounded by a semaphore. Checks sharing a named session run
//! sequentially inside one task; everything else forms one parallel group.
//! Completed invocations stream back into the runner's critical section,
//! where results are committed and routed one at a time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use cascade_journal::{ExecutionJournal, MemoryStore, Snapshot, dependency_results, global_results, outputs_map};
use cascade_types::{
    CheckConfig, CheckResult, EngineEvent, EngineState, FanoutMode, ForwardOrigin, Issue, Scope,
    Severity, SkipReason, WaveKind,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::context::{EngineContext, EventSink, RunState};
use crate::evaluator::{ConditionEvaluator, ConditionScope, ForEachInfo, bool_or_false};
use crate::provider::{ProviderRegistry, ProviderRequest};
use crate::router::{Router, find_for_each_parent};
use crate::schema::validate_output;

/// One scheduling request for the dispatcher, either from the natural level
/// queue (root scope) or a drained forward run (possibly per-item scope).
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DispatchItem {
    pub check_id: String,
    pub scope: Scope,
    pub origin: Option<ForwardOrigin>,
    pub event_override: Option<String>,
}

impl DispatchItem {
    pub fn natural(check_id: impl Into<String>) -> Self {
        Self {
            check_id: check_id.into(),
            scope: Scope::root(),
            origin: None,
            event_override: None,
        }
    }
}

/// A planned provider invocation, self-contained so the spawned task needs
/// no journal access.
struct InvocationPlan {
    check: CheckConfig,
    event: String,
    kind: InvocationKind,
}

enum InvocationKind {
    Single {
        scope: Scope,
        deps: BTreeMap<String, CheckResult>,
    },
    ForEach {
        total: usize,
        /// Merge results into the existing aggregate (per-item retry) rather
        /// than replacing it.
        merge: bool,
        iterations: Vec<IterationPlan>,
    },
}

struct IterationPlan {
    index: usize,
    scope: Scope,
    item: Value,
    deps: BTreeMap<String, CheckResult>,
    /// Pre-resolved skip (failed `assume`); the provider is not invoked.
    skipped: Option<SkipReason>,
}

struct IterationOutcome {
    index: usize,
    scope: Scope,
    item: Value,
    result: CheckResult,
    duration_ms: u64,
}

struct CheckOutcome {
    check_id: String,
    event: String,
    duration_ms: u64,
    kind: OutcomeKind,
    /// Held until the outcome is finalized so the observable
    /// scheduled/completed interleaving respects the parallelism bound.
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

enum OutcomeKind {
    Single {
        scope: Scope,
        result: CheckResult,
    },
    ForEach {
        total: usize,
        merge: bool,
        iterations: Vec<IterationOutcome>,
    },
}

pub(crate) struct LevelDispatcher<'a> {
    pub ctx: &'a Arc<EngineContext>,
    pub registry: &'a ProviderRegistry,
    pub evaluator: &'a Arc<dyn ConditionEvaluator>,
    pub memory: &'a MemoryStore,
    pub sink: &'a EventSink,
}

impl LevelDispatcher<'_> {
    /// Execute one level end to end: gate, spawn, and finalize streamed
    /// completions. Returns once every invocation reached a terminal
    /// outcome.
    pub async fn dispatch_level(
        &self,
        state: &mut RunState,
        journal: &mut ExecutionJournal,
        items: Vec<DispatchItem>,
    ) {
        let level_ids: Vec<String> = items.iter().map(|item| item.check_id.clone()).collect();
        let plans = self.prepare(state, journal, items).await;
        if plans.is_empty() {
            self.sink.emit(EngineEvent::LevelDepleted {
                level: level_ids,
                wave: state.wave,
            });
            return;
        }

        state.transition(self.sink, EngineState::CheckRunning);
        state.active_dispatches = plans.len();

        let semaphore = Arc::new(Semaphore::new(self.ctx.config.max_parallelism));
        let (tx, mut rx) = mpsc::unbounded_channel::<CheckOutcome>();
        let mut tasks: JoinSet<()> = JoinSet::new();

        // Session groups serialize their members; everything else is one
        // parallel group.
        let mut sessions: BTreeMap<String, Vec<InvocationPlan>> = BTreeMap::new();
        let mut pool: Vec<InvocationPlan> = Vec::new();
        for plan in plans {
            match plan.check.session.clone() {
                Some(session) => sessions.entry(session).or_default().push(plan),
                None => pool.push(plan),
            }
        }

        for plan in pool {
            tasks.spawn(run_plan(
                self.ctx.clone(),
                self.registry.clone(),
                self.evaluator.clone(),
                self.sink.clone(),
                plan,
                semaphore.clone(),
                tx.clone(),
            ));
        }
        for (session, group) in sessions {
            debug!(%session, checks = group.len(), "serializing session group");
            let ctx = self.ctx.clone();
            let registry = self.registry.clone();
            let evaluator = self.evaluator.clone();
            let sink = self.sink.clone();
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                for plan in group {
                    run_plan(
                        ctx.clone(),
                        registry.clone(),
                        evaluator.clone(),
                        sink.clone(),
                        plan,
                        semaphore.clone(),
                        tx.clone(),
                    )
                    .await;
                }
            });
        }
        drop(tx);

        while let Some(mut outcome) = rx.recv().await {
            state.transition(self.sink, EngineState::Routing);
            let permit = outcome.permit.take();
            self.finalize_outcome(state, journal, outcome);
            drop(permit);
            let router = self.router();
            router.fire_deferred_on_finish(state, journal);
            state.active_dispatches = state.active_dispatches.saturating_sub(1);
            state.transition(self.sink, EngineState::CheckRunning);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                warn!(%error, "check task aborted");
                state.run_issues.push(Issue::new(
                    Severity::Critical,
                    "system/error",
                    format!("check task aborted: {error}"),
                ));
            }
        }

        self.sink.emit(EngineEvent::LevelDepleted {
            level: level_ids,
            wave: state.wave,
        });
    }

    fn router(&self) -> Router<'_> {
        Router {
            ctx: self.ctx,
            evaluator: self.evaluator.as_ref(),
            memory: self.memory,
            sink: self.sink,
        }
    }

    // ── Gating and planning (serial, journal reads) ──

    async fn prepare(
        &self,
        state: &mut RunState,
        journal: &mut ExecutionJournal,
        items: Vec<DispatchItem>,
    ) -> Vec<InvocationPlan> {
        // Collapse duplicates routing may have re-introduced within the wave.
        let mut seen: Vec<(String, Scope)> = Vec::new();
        let mut unique = Vec::new();
        for item in items {
            let key = (item.check_id.clone(), item.scope.clone());
            if !seen.contains(&key) {
                seen.push(key);
                unique.push(item);
            }
        }

        let mut plans = Vec::new();
        for item in unique {
            let Some(check) = self.ctx.check(&item.check_id).cloned() else {
                warn!(check = %item.check_id, "dispatch requested for unconfigured check");
                continue;
            };
            state.stats_mut(&check.id);
            let event = item
                .event_override
                .clone()
                .unwrap_or_else(|| self.ctx.event.clone());

            if let Some(plan) = self.plan_check(state, journal, &check, &item, event).await {
                plans.push(plan);
            }
        }
        plans
    }

    async fn plan_check(
        &self,
        state: &mut RunState,
        journal: &mut ExecutionJournal,
        check: &CheckConfig,
        item: &DispatchItem,
        event: String,
    ) -> Option<InvocationPlan> {
        debug!(
            check = %check.id,
            scope = %item.scope,
            origin = item.origin.map(|origin| origin.as_str()).unwrap_or("level"),
            "planning dispatch"
        );
        let snapshot = journal.begin_snapshot();

        // `if` guard: false means the provider is not invoked this wave.
        if let Some(expr) = &check.if_expr {
            let scope = self.if_condition_scope(state, journal, snapshot, check);
            if !bool_or_false(self.evaluator.as_ref(), expr, &scope, "if") {
                self.record_skip(state, journal, check, &item.scope, SkipReason::IfCondition, false);
                return None;
            }
        }

        // Dependency gating over OR groups.
        let flat_deps = flatten_deps(check);
        for raw in &check.depends_on {
            let token = crate::resolver::parse_token(raw);
            if !self.token_satisfied(state, journal, snapshot, check, &token.alternatives) {
                self.record_skip(state, journal, check, &item.scope, SkipReason::DependencyFailed, true);
                return None;
            }
        }

        // Per-item retry dispatch: scope names the exact iteration.
        if let Some(leaf) = item.scope.leaf().cloned() {
            return self
                .plan_single_iteration(state, journal, check, item, event, leaf)
                .await;
        }

        // forEach fan-out for map-mode checks fed by an aggregated parent.
        if self.ctx.fanout_of(&check.id) == FanoutMode::Map
            && let Some((parent, items)) = find_for_each_parent(journal, snapshot, check)
        {
            if items.is_empty() {
                self.record_skip(state, journal, check, &item.scope, SkipReason::ForEachEmpty, false);
                return None;
            }
            return self
                .plan_fan_out(state, journal, check, event, parent, items, &flat_deps)
                .await;
        }

        // Single invocation at root scope.
        let deps = dependency_results(journal, snapshot, &flat_deps, &item.scope, None);
        if let Some(expr) = &check.assume {
            let scope = assume_scope(&deps, &event);
            if !bool_or_false(self.evaluator.as_ref(), expr, &scope, "assume") {
                self.record_skip(state, journal, check, &item.scope, SkipReason::Assume, false);
                return None;
            }
        }
        Some(InvocationPlan {
            check: check.clone(),
            event,
            kind: InvocationKind::Single {
                scope: item.scope.clone(),
                deps,
            },
        })
    }

    async fn plan_fan_out(
        &self,
        state: &mut RunState,
        journal: &mut ExecutionJournal,
        check: &CheckConfig,
        event: String,
        parent: String,
        items: Vec<Value>,
        flat_deps: &[String],
    ) -> Option<InvocationPlan> {
        let init_outputs = self.run_on_init(state, journal, check, &event).await;
        let snapshot = journal.begin_snapshot();
        let total = items.len();

        let mut iterations = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let scope = match Scope::root().child(parent.clone(), index) {
                Ok(scope) => scope,
                Err(error) => {
                    warn!(check = %check.id, %error, "fanout scope rejected");
                    continue;
                }
            };
            let mut deps = dependency_results(journal, snapshot, flat_deps, &scope, Some(index));
            for (init_id, init_result) in &init_outputs {
                deps.insert(init_id.clone(), init_result.clone());
            }

            let skipped = check.assume.as_ref().and_then(|expr| {
                let scope = assume_scope(&deps, &event);
                if bool_or_false(self.evaluator.as_ref(), expr, &scope, "assume") {
                    None
                } else {
                    Some(SkipReason::Assume)
                }
            });
            iterations.push(IterationPlan {
                index,
                scope,
                item,
                deps,
                skipped,
            });
        }

        Some(InvocationPlan {
            check: check.clone(),
            event,
            kind: InvocationKind::ForEach {
                total,
                merge: false,
                iterations,
            },
        })
    }

    /// Plan a retry of one specific iteration, merged back into the
    /// aggregate on completion.
    async fn plan_single_iteration(
        &self,
        state: &mut RunState,
        journal: &mut ExecutionJournal,
        check: &CheckConfig,
        item: &DispatchItem,
        event: String,
        leaf: cascade_types::ScopeSegment,
    ) -> Option<InvocationPlan> {
        let snapshot = journal.begin_snapshot();
        // Re-read the parent to observe its latest items on goto-retry.
        let parent_entry = journal.get(&leaf.check_id, &Scope::root(), snapshot)?;
        let items = parent_entry.result.for_each_items.clone().unwrap_or_default();
        let Some(value) = items.get(leaf.index).cloned() else {
            self.record_skip(state, journal, check, &item.scope, SkipReason::ForEachEmpty, false);
            return None;
        };

        let flat_deps = flatten_deps(check);
        let mut deps =
            dependency_results(journal, snapshot, &flat_deps, &item.scope, Some(leaf.index));
        let init_outputs = self.run_on_init(state, journal, check, &event).await;
        for (init_id, init_result) in init_outputs {
            deps.insert(init_id, init_result);
        }

        let skipped = check.assume.as_ref().and_then(|expr| {
            let scope = assume_scope(&deps, &event);
            if bool_or_false(self.evaluator.as_ref(), expr, &scope, "assume") {
                None
            } else {
                Some(SkipReason::Assume)
            }
        });

        Some(InvocationPlan {
            check: check.clone(),
            event,
            kind: InvocationKind::ForEach {
                total: items.len(),
                merge: true,
                iterations: vec![IterationPlan {
                    index: leaf.index,
                    scope: item.scope.clone(),
                    item: value,
                    deps,
                    skipped,
                }],
            },
        })
    }

    /// Execute `on_init` checks once before a forEach loop; their outputs
    /// merge into every iteration's dependency map so preprocessing is not
    /// repeated per item.
    async fn run_on_init(
        &self,
        state: &mut RunState,
        journal: &mut ExecutionJournal,
        check: &CheckConfig,
        event: &str,
    ) -> BTreeMap<String, CheckResult> {
        let mut outputs = BTreeMap::new();
        let Some(init) = &check.on_init else {
            return outputs;
        };
        for init_id in &init.run {
            let Some(init_check) = self.ctx.check(init_id).cloned() else {
                warn!(check = %check.id, init = %init_id, "on_init references unconfigured check");
                continue;
            };
            let snapshot = journal.begin_snapshot();
            let flat = flatten_deps(&init_check);
            let deps = dependency_results(journal, snapshot, &flat, &Scope::root(), None);
            let started = Instant::now();
            let result = self
                .invoke_provider(&init_check, deps.clone(), event, &Scope::root(), None)
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let failed = result.is_failed();
            self.commit(journal, &init_check.id, Scope::root(), event, result.clone());
            state.record_completion(&init_check.id);
            let stats = state.stats_mut(&init_check.id);
            stats.record_run(!failed, duration_ms);
            stats.record_issues(&result.issues);
            if result.output.is_some() {
                stats.outputs_produced += 1;
            }
            if failed {
                state.failed_checks.insert(init_check.id.clone());
            }
            self.sink.emit(EngineEvent::CheckCompleted {
                check_id: init_check.id.clone(),
                scope: Scope::root(),
                result: result.clone(),
            });
            outputs.insert(init_check.id.clone(), result);
        }
        outputs
    }

    /// OR-group satisfaction: one alternative with a committed, non-skipped,
    /// non-failed result — or a failed one tolerated by
    /// `continue_on_failure`. An empty forEach is not a failure for non-map
    /// dependents. Failure includes policy failures tracked only in
    /// `failed_checks` (global fail_if).
    fn token_satisfied(
        &self,
        state: &RunState,
        journal: &ExecutionJournal,
        snapshot: Snapshot,
        check: &CheckConfig,
        alternatives: &[String],
    ) -> bool {
        alternatives.iter().any(|alt| {
            let Some(entry) = journal.get(alt, &Scope::root(), snapshot) else {
                return false;
            };
            let result = &entry.result;
            let failed = result.is_failed() || state.failed_checks.contains(alt);
            if !result.is_skipped() && !failed {
                return true;
            }
            if failed
                && self
                    .ctx
                    .check(alt)
                    .is_some_and(|config| config.continue_on_failure)
            {
                return true;
            }
            result.skip_reason == Some(SkipReason::ForEachEmpty)
                && self.ctx.fanout_of(&check.id) != FanoutMode::Map
        })
    }

    /// Outputs visible to an `if` guard. Forward-run waves give checks with
    /// declared dependencies the global latest outputs; dependency-less
    /// checks only see the current wave, which avoids stale-data loops.
    fn if_condition_scope(
        &self,
        state: &RunState,
        journal: &ExecutionJournal,
        snapshot: Snapshot,
        check: &CheckConfig,
    ) -> ConditionScope {
        let globals = global_results(journal, snapshot);
        let narrow_to_wave = matches!(state.flags.wave_kind, WaveKind::Forward)
            && check.depends_on.is_empty();
        let mut outputs = outputs_map(&globals);
        if narrow_to_wave {
            outputs.retain(|name, _| state.current_wave_completions.contains(name));
        }
        ConditionScope {
            previous_results: outputs,
            event: self.ctx.event.clone(),
            output: None,
            environment: self.ctx.execution_context.get("environment").cloned().unwrap_or(Value::Null),
            workflow_inputs: self
                .ctx
                .execution_context
                .get("workflow_inputs")
                .cloned()
                .unwrap_or(Value::Null),
            branch: self.ctx.pr.as_ref().and_then(|pr| pr.branch.clone()),
            base_branch: self.ctx.pr.as_ref().and_then(|pr| pr.base_branch.clone()),
            files_changed: self
                .ctx
                .pr
                .as_ref()
                .map(|pr| pr.files_changed.clone())
                .unwrap_or_default(),
        }
    }

    fn record_skip(
        &self,
        state: &mut RunState,
        journal: &mut ExecutionJournal,
        check: &CheckConfig,
        scope: &Scope,
        reason: SkipReason,
        failed: bool,
    ) {
        debug!(check = %check.id, %scope, reason = %reason, "check skipped");
        let result = CheckResult::skipped(&check.id, reason);
        self.commit(journal, &check.id, scope.clone(), &self.ctx.event, result.clone());
        state.record_completion(&check.id);
        if failed {
            state.failed_checks.insert(check.id.clone());
        }
        let stats = state.stats_mut(&check.id);
        stats.record_skip(reason);
        stats.record_issues(&result.issues);
        self.sink.emit(EngineEvent::CheckCompleted {
            check_id: check.id.clone(),
            scope: scope.clone(),
            result,
        });
    }

    async fn invoke_provider(
        &self,
        check: &CheckConfig,
        deps: BTreeMap<String, CheckResult>,
        event: &str,
        scope: &Scope,
        for_each: Option<ForEachInfo>,
    ) -> CheckResult {
        invoke(
            self.ctx,
            self.registry,
            self.evaluator.as_ref(),
            check,
            deps,
            event,
            scope,
            for_each,
        )
        .await
    }

    // ── Finalization (serial, single-writer) ──

    fn finalize_outcome(
        &self,
        state: &mut RunState,
        journal: &mut ExecutionJournal,
        outcome: CheckOutcome,
    ) {
        match outcome.kind {
            OutcomeKind::Single { scope, result } => self.finalize_single(
                state,
                journal,
                &outcome.check_id,
                &outcome.event,
                scope,
                result,
                outcome.duration_ms,
            ),
            OutcomeKind::ForEach {
                total,
                merge,
                iterations,
            } => self.finalize_fan_out(
                state,
                journal,
                &outcome.check_id,
                &outcome.event,
                total,
                merge,
                iterations,
            ),
        }
    }

    fn finalize_single(
        &self,
        state: &mut RunState,
        journal: &mut ExecutionJournal,
        check_id: &str,
        event: &str,
        scope: Scope,
        mut result: CheckResult,
        duration_ms: u64,
    ) {
        let Some(check) = self.ctx.check(check_id).cloned() else {
            return;
        };

        // Plain checks commit before routing; routing-appended issues go out
        // through an amended entry (append-only, latest wins).
        self.commit(journal, check_id, scope.clone(), event, result.clone());
        let issues_before = result.issues.len();
        let router = self.router();
        router.route(state, journal, &check, &scope, &mut result);
        if result.issues.len() > issues_before {
            self.commit(journal, check_id, scope.clone(), event, result.clone());
        }

        let failed = state.failed_checks.contains(check_id);
        self.account(state, check_id, &result, failed, duration_ms);
        state.record_completion(check_id);
        if result.awaiting_human_input {
            state.flags.awaiting_human_input = true;
        }
        self.sink.emit(EngineEvent::CheckCompleted {
            check_id: check_id.to_string(),
            scope,
            result,
        });
        self.apply_fail_fast(state, failed);
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize_fan_out(
        &self,
        state: &mut RunState,
        journal: &mut ExecutionJournal,
        check_id: &str,
        event: &str,
        total: usize,
        merge: bool,
        iterations: Vec<IterationOutcome>,
    ) {
        let Some(check) = self.ctx.check(check_id).cloned() else {
            return;
        };

        // Per-item entries first: dependents and views read these.
        for iteration in &iterations {
            self.commit(
                journal,
                check_id,
                iteration.scope.clone(),
                event,
                iteration.result.clone(),
            );
            self.sink.emit(EngineEvent::CheckCompleted {
                check_id: check_id.to_string(),
                scope: iteration.scope.clone(),
                result: iteration.result.clone(),
            });
        }

        let mut aggregate = if merge {
            let snapshot = journal.latest_snapshot();
            journal
                .get(check_id, &Scope::root(), snapshot)
                .map(|entry| entry.result.clone())
                .unwrap_or_else(|| empty_aggregate(total))
        } else {
            empty_aggregate(total)
        };
        merge_iterations(&mut aggregate, &iterations);

        // Routing runs before the aggregated commit so routing errors are
        // captured in the persisted result.
        let issues_before = aggregate.issues.len();
        let router = self.router();
        router.route(state, journal, &check, &Scope::root(), &mut aggregate);
        let routing_issues: Vec<Issue> = aggregate.issues[issues_before..].to_vec();
        self.commit(journal, check_id, Scope::root(), event, aggregate.clone());

        let failed = state.failed_checks.contains(check_id);
        let durations: Vec<u64> = iterations.iter().map(|i| i.duration_ms).collect();
        let preview: Vec<String> = aggregate
            .for_each_items
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .take(3)
            .map(preview_item)
            .collect();
        for iteration in &iterations {
            if iteration.result.is_skipped() {
                continue;
            }
            let stats = state.stats_mut(check_id);
            stats.record_run(!iteration.result.is_failed(), iteration.duration_ms);
            stats.record_issues(&iteration.result.issues);
            if iteration.result.output.is_some() {
                stats.outputs_produced += 1;
            }
        }
        let stats = state.stats_mut(check_id);
        stats.record_issues(&routing_issues);
        match &mut stats.per_iteration_duration_ms {
            Some(existing) => existing.extend(durations),
            None => stats.per_iteration_duration_ms = Some(durations),
        }
        stats.for_each_preview = Some(preview);

        state.record_completion(check_id);
        if aggregate.awaiting_human_input {
            state.flags.awaiting_human_input = true;
        }
        self.sink.emit(EngineEvent::CheckCompleted {
            check_id: check_id.to_string(),
            scope: Scope::root(),
            result: aggregate,
        });
        self.apply_fail_fast(state, failed);
    }

    fn account(
        &self,
        state: &mut RunState,
        check_id: &str,
        result: &CheckResult,
        failed: bool,
        duration_ms: u64,
    ) {
        let stats = state.stats_mut(check_id);
        stats.record_run(!failed, duration_ms);
        stats.record_issues(&result.issues);
        if result.output.is_some() {
            stats.outputs_produced += 1;
        }
    }

    fn apply_fail_fast(&self, state: &mut RunState, failed: bool) {
        if failed && self.ctx.config.fail_fast && !state.flags.fail_fast_triggered {
            debug!("fail-fast triggered, clearing remaining level queue");
            state.flags.fail_fast_triggered = true;
            state.level_queue.clear();
        }
    }

    fn commit(
        &self,
        journal: &mut ExecutionJournal,
        check_id: &str,
        scope: Scope,
        event: &str,
        result: CheckResult,
    ) {
        let entry = cascade_types::JournalEntry::new(
            self.ctx.session_id.clone(),
            check_id,
            scope,
            event,
            result,
        );
        if let Err(error) = journal.commit_entry(entry) {
            warn!(check = check_id, %error, "journal commit rejected");
        }
    }
}

/// Execute one plan in a spawned task and send its outcome back to the
/// runner. Emits `CheckScheduled` as each invocation acquires a permit, so
/// observed scheduling reflects the parallelism bound.
#[allow(clippy::too_many_arguments)]
async fn run_plan(
    ctx: Arc<EngineContext>,
    registry: ProviderRegistry,
    evaluator: Arc<dyn ConditionEvaluator>,
    sink: EventSink,
    plan: InvocationPlan,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<CheckOutcome>,
) {
    let started = Instant::now();
    let outcome = match plan.kind {
        InvocationKind::Single { scope, deps } => {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");
            sink.emit(EngineEvent::CheckScheduled {
                check_id: plan.check.id.clone(),
                scope: scope.clone(),
            });
            let result = invoke(
                &ctx,
                &registry,
                evaluator.as_ref(),
                &plan.check,
                deps,
                &plan.event,
                &scope,
                None,
            )
            .await;
            CheckOutcome {
                check_id: plan.check.id.clone(),
                event: plan.event,
                duration_ms: started.elapsed().as_millis() as u64,
                kind: OutcomeKind::Single { scope, result },
                permit: Some(permit),
            }
        }
        InvocationKind::ForEach {
            total,
            merge,
            iterations,
        } => {
            let mut outcomes = Vec::with_capacity(iterations.len());
            for iteration in iterations {
                let iter_started = Instant::now();
                let result = match iteration.skipped {
                    Some(reason) => CheckResult::skipped(&plan.check.id, reason),
                    None => {
                        let permit = semaphore.acquire().await.expect("semaphore closed");
                        sink.emit(EngineEvent::CheckScheduled {
                            check_id: plan.check.id.clone(),
                            scope: iteration.scope.clone(),
                        });
                        let for_each = ForEachInfo {
                            index: iteration.index,
                            total,
                            item: iteration.item.clone(),
                        };
                        let result = invoke(
                            &ctx,
                            &registry,
                            evaluator.as_ref(),
                            &plan.check,
                            iteration.deps.clone(),
                            &plan.event,
                            &iteration.scope,
                            Some(for_each),
                        )
                        .await;
                        drop(permit);
                        result
                    }
                };
                outcomes.push(IterationOutcome {
                    index: iteration.index,
                    scope: iteration.scope,
                    item: iteration.item,
                    result,
                    duration_ms: iter_started.elapsed().as_millis() as u64,
                });
            }
            CheckOutcome {
                check_id: plan.check.id.clone(),
                event: plan.event,
                duration_ms: started.elapsed().as_millis() as u64,
                kind: OutcomeKind::ForEach {
                    total,
                    merge,
                    iterations: outcomes,
                },
                permit: None,
            }
        }
    };
    let _ = tx.send(outcome);
}

/// Flatten `depends_on` tokens into the full alternative list for view
/// construction.
fn flatten_deps(check: &CheckConfig) -> Vec<String> {
    check
        .depends_on
        .iter()
        .flat_map(|raw| crate::resolver::parse_token(raw).alternatives)
        .collect()
}

fn assume_scope(deps: &BTreeMap<String, CheckResult>, event: &str) -> ConditionScope {
    let mut previous_results = serde_json::Map::new();
    for (name, result) in deps {
        previous_results.insert(name.clone(), result.output.clone().unwrap_or(Value::Null));
    }
    ConditionScope {
        previous_results,
        event: event.to_string(),
        ..ConditionScope::default()
    }
}

fn empty_aggregate(total: usize) -> CheckResult {
    CheckResult {
        is_for_each: true,
        for_each_items: Some(vec![Value::Null; total]),
        for_each_item_results: Some(vec![CheckResult::default(); total]),
        ..CheckResult::default()
    }
}

/// Fold per-iteration outcomes into the aggregate: outputs (or failure
/// markers) into `for_each_items`, summaries into `for_each_item_results`,
/// and the issue union at the top level.
fn merge_iterations(aggregate: &mut CheckResult, iterations: &[IterationOutcome]) {
    let total = aggregate
        .for_each_items
        .as_ref()
        .map(Vec::len)
        .unwrap_or(0)
        .max(iterations.iter().map(|i| i.index + 1).max().unwrap_or(0));
    let items = aggregate
        .for_each_items
        .get_or_insert_with(Vec::new);
    items.resize(total, Value::Null);
    let summaries = aggregate
        .for_each_item_results
        .get_or_insert_with(Vec::new);
    summaries.resize(total, CheckResult::default());

    for iteration in iterations {
        let slot = if iteration.result.is_failed() {
            let message = iteration
                .result
                .issues
                .iter()
                .find(|issue| issue.is_fatal())
                .map(|issue| issue.message.clone())
                .unwrap_or_else(|| "iteration failed".to_string());
            let mut marker = serde_json::Map::new();
            marker.insert(cascade_types::FAILED_MARKER.to_string(), Value::Bool(true));
            marker.insert("error".to_string(), Value::String(message));
            Value::Object(marker)
        } else {
            iteration.result.output.clone().unwrap_or(Value::Null)
        };
        items[iteration.index] = slot;
        let mut summary = iteration.result.clone();
        summary.is_for_each = false;
        summaries[iteration.index] = summary;
    }

    aggregate.is_for_each = true;
    aggregate.output = Some(Value::Array(
        aggregate.for_each_items.clone().unwrap_or_default(),
    ));
    let mut issues = Vec::new();
    if let Some(summaries) = &aggregate.for_each_item_results {
        for summary in summaries {
            issues.extend(summary.issues.iter().cloned());
        }
    }
    aggregate.issues = issues;
    aggregate.awaiting_human_input = aggregate
        .for_each_item_results
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .any(|summary| summary.awaiting_human_input);
}

fn preview_item(item: &Value) -> String {
    let rendered = item.to_string();
    if rendered.chars().count() > 80 {
        let truncated: String = rendered.chars().take(80).collect();
        format!("{truncated}…")
    } else {
        rendered
    }
}

/// The per-invocation pipeline: provider execution under timeout and
/// cancellation, then schema validation, then `guarantee`. `fail_if` runs in
/// the router after commit.
#[allow(clippy::too_many_arguments)]
async fn invoke(
    ctx: &Arc<EngineContext>,
    registry: &ProviderRegistry,
    evaluator: &dyn ConditionEvaluator,
    check: &CheckConfig,
    deps: BTreeMap<String, CheckResult>,
    event: &str,
    scope: &Scope,
    for_each: Option<ForEachInfo>,
) -> CheckResult {
    let Some(provider) = registry.get(&check.check_type) else {
        return CheckResult::fatal(
            format!("{}/error", check.id),
            format!("no provider registered for type '{}'", check.check_type),
        );
    };

    let request = ProviderRequest {
        check_id: check.id.clone(),
        payload: check.payload.clone(),
        dependencies: deps.clone(),
        event: event.to_string(),
        execution_context: ctx.execution_context.clone(),
        scope: scope.clone(),
        for_each,
        cancellation: ctx.cancellation.child_token(),
    };

    let timeout_ms = ctx.timeout_ms(check);
    let timeout = std::time::Duration::from_millis(timeout_ms);
    let mut result = match tokio::time::timeout(timeout, provider.execute(request)).await {
        Ok(Ok(result)) => result,
        Ok(Err(error)) => {
            return CheckResult::fatal(
                format!("{}/error", check.id),
                format!("provider failed: {error:#}"),
            );
        }
        Err(_) => {
            return CheckResult::fatal(
                format!("{}/execution_error", check.id),
                format!("provider timed out after {timeout_ms}ms"),
            );
        }
    };

    // A forEach source must produce an iterable; anything else is an
    // execution error so map dependents cascade-skip cleanly.
    if check.for_each {
        match result.output.clone() {
            Some(Value::Array(items)) => {
                result.is_for_each = true;
                result.for_each_items = Some(items);
            }
            Some(_) | None => {
                result.push_issue(Issue::new(
                    Severity::Critical,
                    "forEach/execution_error",
                    format!("forEach check '{}' did not produce an array output", check.id),
                ));
                result.is_for_each = true;
                result.for_each_items = Some(Vec::new());
            }
        }
    }

    if let Some(spec) = &check.schema {
        let issues = validate_output(&check.id, result.output.as_ref(), spec, &ctx.config.schemas);
        for issue in issues {
            result.push_issue(issue);
        }
    }

    if let Some(expr) = &check.guarantee {
        let mut guarantee_scope = assume_scope(&deps, event);
        guarantee_scope.output = result.output.clone();
        if !bool_or_false(evaluator, expr, &guarantee_scope, "guarantee") {
            result.push_issue(
                Issue::new(
                    Severity::Warning,
                    "contract/guarantee_failed",
                    format!("guarantee '{expr}' not satisfied"),
                )
                .with_category("contract"),
            );
        }
    }

    result
}
