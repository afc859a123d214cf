//! Routing: entered after every check completion, including routing errors.
//!
//! Order of operations per pass: evaluate `fail_if` (global first, then
//! check-level), select the `on_success`/`on_fail` branch, process the branch
//! (`run`, `run_js`, `retry`, then `transitions` or `goto_js`/`goto`), then
//! `on_finish`. Every forward-run emission consumes loop budget uniformly;
//! the emission past the budget records `routing/loop_budget_exceeded` and
//! aborts the remaining routing for the check.
//!
//! A routing pass is atomic from the runner's perspective: no suspension
//! points, all expression evaluation is synchronous and fail-secure.

use cascade_journal::{
    ExecutionJournal, MemoryStore, Snapshot, global_results, history_outputs, outputs_map,
};
use cascade_types::{
    CheckConfig, CheckResult, EngineEvent, ForwardOrigin, GLOBAL_FAIL_IF, Issue, RetryPolicy,
    RoutingBlock, Scope, Severity,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::{EngineContext, EventSink, ForwardRun, RunState};
use crate::evaluator::{
    ConditionEvaluator, ConditionScope, RoutingScope, bool_or_false, routing_bool_or_false,
    target_or_none, targets_or_empty,
};

/// Find the forEach parent feeding `check`: the first `depends_on`
/// alternative whose latest root-scope result is an aggregated forEach.
/// Returns the parent id and its current items.
pub(crate) fn find_for_each_parent(
    journal: &ExecutionJournal,
    snapshot: Snapshot,
    check: &CheckConfig,
) -> Option<(String, Vec<Value>)> {
    for raw in &check.depends_on {
        for alt in crate::resolver::parse_token(raw).alternatives {
            if let Some(entry) = journal.get(&alt, &Scope::root(), snapshot)
                && entry.result.is_for_each
                && let Some(items) = &entry.result.for_each_items
            {
                return Some((alt, items.clone()));
            }
        }
    }
    None
}

pub(crate) struct Router<'a> {
    pub ctx: &'a EngineContext,
    pub evaluator: &'a dyn ConditionEvaluator,
    pub memory: &'a MemoryStore,
    pub sink: &'a EventSink,
}

impl Router<'_> {
    /// Route one completed check. Appends policy and budget issues to
    /// `result` in place so the caller can persist them with the outcome.
    pub fn route(
        &self,
        state: &mut RunState,
        journal: &ExecutionJournal,
        check: &CheckConfig,
        scope: &Scope,
        result: &mut CheckResult,
    ) {
        let snapshot = journal.latest_snapshot();
        let emitted_before = state.routing_loop_count;
        let mut budget_exhausted = false;

        let condition_scope = self.condition_scope(journal, snapshot, result.output.clone());

        let mut global_failed = false;
        if let Some(expr) = &self.ctx.config.fail_if
            && bool_or_false(self.evaluator, expr, &condition_scope, "global fail_if")
        {
            result.push_issue(Issue::new(
                Severity::Critical,
                GLOBAL_FAIL_IF,
                format!("global fail_if triggered: {expr}"),
            ));
            global_failed = true;
        }
        if let Some(expr) = &check.fail_if
            && bool_or_false(self.evaluator, expr, &condition_scope, "fail_if")
        {
            result.push_issue(Issue::new(
                Severity::Critical,
                format!("{}_fail_if", check.id),
                format!("fail_if triggered: {expr}"),
            ));
        }

        let failed = result.is_failed() || global_failed;
        if failed {
            // A partially failed forEach aggregate routes through on_fail
            // (so failed iterations can retry) without blocking dependents.
            let total_items = result.for_each_items.as_ref().map_or(0, Vec::len);
            let partial = result.is_for_each
                && total_items > 0
                && result.failed_item_indices().len() < total_items
                && !global_failed;
            if !partial {
                state.failed_checks.insert(check.id.clone());
            }
        } else {
            // A later successful run clears an earlier failure so dependents
            // scheduled in forward waves can proceed.
            state.failed_checks.remove(&check.id);
        }

        let routing_scope = self.routing_scope(journal, snapshot, check, result.output.clone());

        let branch = if failed {
            check.on_fail.as_ref()
        } else {
            check.on_success.as_ref()
        };
        if let Some(block) = branch {
            self.process_block(
                state,
                journal,
                snapshot,
                check,
                scope,
                result,
                &routing_scope,
                block,
                failed,
                &mut budget_exhausted,
            );
        } else if failed && check.retry.is_some() {
            // Check-level retry applies even without an on_fail block.
            let fallback = RoutingBlock::default();
            self.process_block(
                state,
                journal,
                snapshot,
                check,
                scope,
                result,
                &routing_scope,
                &fallback,
                failed,
                &mut budget_exhausted,
            );
        }

        // on_finish runs last; a forEach parent with map-fanout dependents
        // defers it until all children complete.
        if !budget_exhausted && check.on_finish.is_some() {
            if result.is_for_each && self.has_map_dependents(state, &check.id) {
                state.deferred_on_finish.insert(check.id.clone());
            } else if let Some(block) = &check.on_finish {
                self.process_block(
                    state,
                    journal,
                    snapshot,
                    check,
                    scope,
                    result,
                    &routing_scope,
                    block,
                    failed,
                    &mut budget_exhausted,
                );
            }
        }

        self.request_wave_retry(state, &check.id, emitted_before);
    }

    /// Fire deferred `on_finish` blocks for forEach parents whose map-fanout
    /// dependents have all completed. Routing issues raised here are
    /// persisted through an amended aggregate entry.
    pub fn fire_deferred_on_finish(&self, state: &mut RunState, journal: &mut ExecutionJournal) {
        let ready: Vec<String> = state
            .deferred_on_finish
            .iter()
            .filter(|parent| {
                self.map_dependents(state, parent)
                    .iter()
                    .all(|dependent| state.completed_checks.contains(dependent))
            })
            .cloned()
            .collect();

        for parent in ready {
            state.deferred_on_finish.remove(&parent);
            let Some(check) = self.ctx.check(&parent) else {
                continue;
            };
            let Some(block) = check.on_finish.clone() else {
                continue;
            };
            let snapshot = journal.latest_snapshot();
            let Some(entry) = journal.get(&parent, &Scope::root(), snapshot) else {
                continue;
            };
            let mut result = entry.result.clone();
            let failed = result.is_failed();
            let emitted_before = state.routing_loop_count;
            let mut budget_exhausted = false;
            let routing_scope = self.routing_scope(journal, snapshot, check, result.output.clone());
            let issues_before = result.issues.len();

            self.process_block(
                state,
                journal,
                snapshot,
                check,
                &Scope::root(),
                &mut result,
                &routing_scope,
                &block,
                failed,
                &mut budget_exhausted,
            );
            self.request_wave_retry(state, &parent, emitted_before);

            if result.issues.len() > issues_before {
                let amended = cascade_types::JournalEntry::new(
                    self.ctx.session_id.clone(),
                    parent.clone(),
                    Scope::root(),
                    self.ctx.event.clone(),
                    result,
                );
                if let Err(error) = journal.commit_entry(amended) {
                    warn!(%parent, %error, "failed to persist amended on_finish result");
                }
            }
        }
    }

    fn map_dependents(&self, state: &RunState, parent: &str) -> Vec<String> {
        state
            .reverse
            .get(parent)
            .map(|dependents| {
                dependents
                    .iter()
                    .filter(|id| self.ctx.checks.contains_key(*id))
                    .filter(|id| self.ctx.fanout_of(id) == cascade_types::FanoutMode::Map)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn has_map_dependents(&self, state: &RunState, parent: &str) -> bool {
        !self.map_dependents(state, parent).is_empty()
    }

    #[allow(clippy::too_many_arguments)]
    fn process_block(
        &self,
        state: &mut RunState,
        journal: &ExecutionJournal,
        snapshot: Snapshot,
        check: &CheckConfig,
        scope: &Scope,
        result: &mut CheckResult,
        routing_scope: &RoutingScope,
        block: &RoutingBlock,
        failed: bool,
        budget_exhausted: &mut bool,
    ) {
        for target in block.run.clone() {
            let runs = self.forward_targets(&check.id, result, &target, ForwardOrigin::Run, None);
            self.emit_all(state, result, &check.id, runs, budget_exhausted);
        }

        if let Some(expr) = &block.run_js {
            for target in targets_or_empty(self.evaluator, expr, routing_scope) {
                let runs =
                    self.forward_targets(&check.id, result, &target, ForwardOrigin::RunJs, None);
                self.emit_all(state, result, &check.id, runs, budget_exhausted);
            }
        }

        // Nothing but an explicit retry policy recovers a failure implicitly.
        if failed {
            let policy = block.retry.as_ref().or(check.retry.as_ref());
            if let Some(policy) = policy {
                self.process_retry(state, journal, snapshot, check, scope, result, policy, budget_exhausted);
            }
        }

        if !block.transitions.is_empty() {
            for rule in &block.transitions {
                if routing_bool_or_false(self.evaluator, &rule.when, routing_scope, "transition") {
                    match &rule.to {
                        Some(target) => {
                            let runs = self.forward_targets(
                                &check.id,
                                result,
                                target,
                                ForwardOrigin::Goto,
                                block.goto_event.clone(),
                            );
                            self.emit_all(state, result, &check.id, runs, budget_exhausted);
                        }
                        // Explicit no-op: overrides goto/goto_js, schedules
                        // nothing, and does not request a wave retry.
                        None => debug!(check = %check.id, when = %rule.when, "transition no-op"),
                    }
                    return;
                }
            }
            // Declared transitions suppress the goto path even when no rule
            // matches.
            return;
        }

        let mut goto_js_target = None;
        if let Some(expr) = &block.goto_js {
            goto_js_target = target_or_none(self.evaluator, expr, routing_scope);
            if let Some(target) = &goto_js_target {
                let runs = self.forward_targets(
                    &check.id,
                    result,
                    target,
                    ForwardOrigin::GotoJs,
                    block.goto_event.clone(),
                );
                self.emit_all(state, result, &check.id, runs, budget_exhausted);
            }
        }
        if goto_js_target.is_none()
            && let Some(target) = &block.goto
        {
            let runs = self.forward_targets(
                &check.id,
                result,
                target,
                ForwardOrigin::Goto,
                block.goto_event.clone(),
            );
            self.emit_all(state, result, &check.id, runs, budget_exhausted);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_retry(
        &self,
        state: &mut RunState,
        journal: &ExecutionJournal,
        snapshot: Snapshot,
        check: &CheckConfig,
        scope: &Scope,
        result: &mut CheckResult,
        policy: &RetryPolicy,
        budget_exhausted: &mut bool,
    ) {
        let failed_indices = result.failed_item_indices();
        if result.is_for_each && !failed_indices.is_empty() {
            // Only iterations whose output is marked failed are re-dispatched.
            let Some((parent, _items)) = find_for_each_parent(journal, snapshot, check) else {
                return;
            };
            for index in failed_indices {
                let item_scope = Scope::item(parent.clone(), index);
                self.emit_retry(state, result, check, item_scope, policy, budget_exhausted);
            }
        } else {
            self.emit_retry(state, result, check, scope.clone(), policy, budget_exhausted);
        }
    }

    fn emit_retry(
        &self,
        state: &mut RunState,
        result: &mut CheckResult,
        check: &CheckConfig,
        scope: Scope,
        policy: &RetryPolicy,
        budget_exhausted: &mut bool,
    ) {
        let key = (check.id.clone(), scope.clone());
        let attempts = state.retry_attempts.get(&key).copied().unwrap_or(0);
        if attempts >= policy.max {
            debug!(check = %check.id, %scope, attempts, "retry budget exhausted");
            return;
        }
        let attempt = attempts + 1;
        let delay_ms = policy.backoff.delay_for_attempt(attempt);
        let forward = ForwardRun {
            target: check.id.clone(),
            scope,
            origin: ForwardOrigin::Retry,
            event_override: None,
            delay_ms: Some(delay_ms),
        };
        if self.emit_forward(state, result, &check.id, forward, budget_exhausted) {
            state.retry_attempts.insert(key, attempt);
            state.stats_mut(&check.id).retry_attempts += 1;
        }
    }

    /// Expand a routing target into forward runs, fanning out per item when
    /// the target maps over the originating check's forEach items.
    fn forward_targets(
        &self,
        origin_check: &str,
        origin_result: &CheckResult,
        target: &str,
        origin: ForwardOrigin,
        event_override: Option<String>,
    ) -> Vec<ForwardRun> {
        let items = origin_result
            .for_each_items
            .as_ref()
            .filter(|items| !items.is_empty());

        match items {
            Some(items) if self.ctx.fanout_of(target) == cascade_types::FanoutMode::Map => (0
                ..items.len())
                .map(|index| ForwardRun {
                    target: target.to_string(),
                    scope: Scope::item(origin_check, index),
                    origin,
                    event_override: event_override.clone(),
                    delay_ms: None,
                })
                .collect(),
            _ => vec![ForwardRun {
                target: target.to_string(),
                scope: Scope::root(),
                origin,
                event_override,
                delay_ms: None,
            }],
        }
    }

    fn emit_all(
        &self,
        state: &mut RunState,
        result: &mut CheckResult,
        check_id: &str,
        forwards: Vec<ForwardRun>,
        budget_exhausted: &mut bool,
    ) {
        for forward in forwards {
            self.emit_forward(state, result, check_id, forward, budget_exhausted);
        }
    }

    /// Emit one forward run, enforcing the loop budget. Returns whether the
    /// emission went through.
    fn emit_forward(
        &self,
        state: &mut RunState,
        result: &mut CheckResult,
        check_id: &str,
        forward: ForwardRun,
        budget_exhausted: &mut bool,
    ) -> bool {
        if *budget_exhausted {
            return false;
        }
        let max_loops = self.ctx.config.routing.max_loops;
        if state.routing_loop_count >= max_loops {
            warn!(
                check = check_id,
                target = %forward.target,
                max_loops,
                "routing loop budget exceeded"
            );
            result.push_issue(Issue::new(
                Severity::Error,
                format!("{check_id}/routing/loop_budget_exceeded"),
                format!(
                    "routing loop budget of {max_loops} exhausted; dropping forward run to '{}'",
                    forward.target
                ),
            ));
            *budget_exhausted = true;
            return false;
        }

        state.routing_loop_count += 1;
        state.flags.forward_run_requested = true;
        debug!(
            check = check_id,
            target = %forward.target,
            origin = forward.origin.as_str(),
            scope = %forward.scope,
            "forward run requested"
        );
        let event = EngineEvent::ForwardRunRequested {
            target: forward.target,
            scope: forward.scope,
            origin: forward.origin,
            goto_event: forward.event_override,
            delay_ms: forward.delay_ms,
        };
        state.event_queue.push_back(event.clone());
        self.sink.emit(event);
        true
    }

    /// Enqueue a `WaveRetry` when this pass emitted anything, deduplicated
    /// per `(trigger, check, wave)`.
    fn request_wave_retry(&self, state: &mut RunState, check_id: &str, emitted_before: u32) {
        if state.routing_loop_count == emitted_before {
            return;
        }
        let guard = format!("{}:{}:{}", self.ctx.event, check_id, state.wave);
        if state.forward_run_guards.insert(guard) {
            let event = EngineEvent::WaveRetry {
                reason: format!("forward runs requested by '{check_id}'"),
            };
            state.event_queue.push_back(event.clone());
            self.sink.emit(event);
        }
    }

    fn condition_scope(
        &self,
        journal: &ExecutionJournal,
        snapshot: Snapshot,
        output: Option<Value>,
    ) -> ConditionScope {
        let globals = global_results(journal, snapshot);
        ConditionScope {
            previous_results: outputs_map(&globals),
            event: self.ctx.event.clone(),
            output,
            environment: bag_member(&self.ctx.execution_context, "environment"),
            workflow_inputs: bag_member(&self.ctx.execution_context, "workflow_inputs"),
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

    fn routing_scope(
        &self,
        journal: &ExecutionJournal,
        snapshot: Snapshot,
        check: &CheckConfig,
        output: Option<Value>,
    ) -> RoutingScope {
        let globals = global_results(journal, snapshot);
        RoutingScope {
            step: check.id.clone(),
            outputs: outputs_map(&globals),
            outputs_history: history_outputs(journal, snapshot),
            output,
            memory: self.memory.snapshot(),
            event: self.ctx.event.clone(),
            for_each: None,
        }
    }
}

/// Extract a named member from the opaque execution-context bag, `Null` when
/// absent.
fn bag_member(bag: &Value, key: &str) -> Value {
    bag.get(key).cloned().unwrap_or(Value::Null)
}
