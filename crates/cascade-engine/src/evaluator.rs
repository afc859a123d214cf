//! The expression-evaluator seam.
//!
//! The engine never interprets `if`/`assume`/`guarantee`/`fail_if` or the
//! `*_js` routing expressions itself; it constructs a typed snapshot of the
//! run and hands it to an external, sandboxed evaluator. Evaluation is
//! fail-secure throughout: any evaluator error is treated as `false` (or an
//! empty target list) and logged, never propagated.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
#[error("expression evaluation failed: {0}")]
pub struct EvalError(pub String);

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Context for the condition family: `if`, `assume`, `guarantee`, `fail_if`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConditionScope {
    /// Outputs visible to this check, keyed by check name.
    pub previous_results: Map<String, Value>,
    /// Trigger name for the run (or the forward-run override).
    pub event: String,
    /// The current check's own output, when evaluated post-execution.
    pub output: Option<Value>,
    pub environment: Value,
    pub workflow_inputs: Value,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub files_changed: Vec<String>,
}

/// Per-iteration view handed to mappers and their expressions.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForEachInfo {
    pub index: usize,
    pub total: usize,
    pub item: Value,
}

/// Context for the routing family: `goto_js`, `run_js`, and `transitions`
/// `when` clauses.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RoutingScope {
    /// The check being routed.
    pub step: String,
    /// Global namespace: latest root-scope output per check.
    pub outputs: Map<String, Value>,
    /// Full per-check output series.
    pub outputs_history: Map<String, Value>,
    /// The routed check's own output.
    pub output: Option<Value>,
    /// Snapshot of the namespaced memory store.
    pub memory: Value,
    pub event: String,
    pub for_each: Option<ForEachInfo>,
}

/// External contract for the sandboxed expression evaluator.
///
/// Implementations must be side-effect free from the engine's perspective;
/// the engine serializes all calls through routing and gating.
pub trait ConditionEvaluator: Send + Sync {
    fn eval_bool(&self, expr: &str, scope: &ConditionScope) -> Result<bool, EvalError>;

    fn eval_routing_bool(&self, expr: &str, scope: &RoutingScope) -> Result<bool, EvalError>;

    /// Evaluate a `run_js` expression to a list of check ids.
    fn eval_targets(&self, expr: &str, scope: &RoutingScope) -> Result<Vec<String>, EvalError>;

    /// Evaluate a `goto_js` expression to an optional target id.
    fn eval_target(&self, expr: &str, scope: &RoutingScope) -> Result<Option<String>, EvalError>;
}

pub(crate) fn bool_or_false(
    evaluator: &dyn ConditionEvaluator,
    expr: &str,
    scope: &ConditionScope,
    what: &str,
) -> bool {
    match evaluator.eval_bool(expr, scope) {
        Ok(value) => value,
        Err(error) => {
            warn!(%expr, %what, %error, "condition evaluation failed, treating as false");
            false
        }
    }
}

pub(crate) fn routing_bool_or_false(
    evaluator: &dyn ConditionEvaluator,
    expr: &str,
    scope: &RoutingScope,
    what: &str,
) -> bool {
    match evaluator.eval_routing_bool(expr, scope) {
        Ok(value) => value,
        Err(error) => {
            warn!(%expr, %what, %error, "routing condition failed, treating as false");
            false
        }
    }
}

pub(crate) fn targets_or_empty(
    evaluator: &dyn ConditionEvaluator,
    expr: &str,
    scope: &RoutingScope,
) -> Vec<String> {
    match evaluator.eval_targets(expr, scope) {
        Ok(targets) => targets,
        Err(error) => {
            warn!(%expr, %error, "run_js evaluation failed, no targets scheduled");
            Vec::new()
        }
    }
}

pub(crate) fn target_or_none(
    evaluator: &dyn ConditionEvaluator,
    expr: &str,
    scope: &RoutingScope,
) -> Option<String> {
    match evaluator.eval_target(expr, scope) {
        Ok(target) => target,
        Err(error) => {
            warn!(%expr, %error, "goto_js evaluation failed, no target selected");
            None
        }
    }
}
