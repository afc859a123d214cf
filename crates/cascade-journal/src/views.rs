//! Dependency-result views over the journal.
//!
//! These functions implement the read side of forEach fan-out: a dispatching
//! check never sees raw journal entries, it sees a per-name map of results
//! assembled here. The slicing policy preserves the intuition that
//! `outputs["x"]` means "x's result as visible from here", whether the
//! consumer is a reducer or a per-item mapper.

use std::collections::BTreeMap;

use cascade_types::{CheckResult, Scope};
use serde_json::{Map, Value};

use crate::journal::{ExecutionJournal, Snapshot};

/// Suffix appended to a forEach parent's name for the full-aggregate view in
/// the global namespace.
pub const RAW_SUFFIX: &str = "-raw";

/// Slice item `index` out of an aggregated forEach result.
///
/// The per-item summary (if recorded) is overlaid with the per-item output,
/// so consumers see `{..forEachItemResults[i], output: forEachItems[i]}`.
pub fn slice_item(aggregate: &CheckResult, index: usize) -> CheckResult {
    let mut item = aggregate
        .for_each_item_results
        .as_ref()
        .and_then(|summaries| summaries.get(index))
        .cloned()
        .unwrap_or_default();
    item.output = aggregate
        .for_each_items
        .as_ref()
        .and_then(|items| items.get(index))
        .cloned();
    item.is_for_each = false;
    item.for_each_items = None;
    item.for_each_item_results = None;
    item
}

/// Build the explicit-dependency view for a check dispatching at `scope`.
///
/// Per dependency: latest entry with the exact scope (the journal falls back
/// to the root aggregate when no scoped entry exists); aggregated forEach
/// results are sliced to `item_index` when the consumer is iterating.
pub fn dependency_results(
    journal: &ExecutionJournal,
    snapshot: Snapshot,
    dep_ids: &[String],
    scope: &Scope,
    item_index: Option<usize>,
) -> BTreeMap<String, CheckResult> {
    let mut results = BTreeMap::new();
    for dep_id in dep_ids {
        let Some(entry) = journal.get(dep_id, scope, snapshot) else {
            continue;
        };
        let result = &entry.result;
        let view = match item_index {
            Some(index) if result.for_each_items.is_some() => slice_item(result, index),
            _ => result.clone(),
        };
        results.insert(dep_id.clone(), view);
    }
    results
}

/// Build the global namespace: every check's latest root-scope result under
/// its name, plus `<name>-raw` exposing the full item array for forEach
/// aggregates.
pub fn global_results(
    journal: &ExecutionJournal,
    snapshot: Snapshot,
) -> BTreeMap<String, CheckResult> {
    let mut results = BTreeMap::new();
    for (name, result) in journal.latest_root_results(snapshot) {
        if let Some(items) = &result.for_each_items {
            let raw = CheckResult::with_output(Value::Array(items.clone()));
            results.insert(format!("{name}{RAW_SUFFIX}"), raw);
        }
        results.insert(name, result.clone());
    }
    results
}

/// Project a result map down to `name -> output` for expression contexts.
pub fn outputs_map(results: &BTreeMap<String, CheckResult>) -> Map<String, Value> {
    results
        .iter()
        .map(|(name, result)| {
            (
                name.clone(),
                result.output.clone().unwrap_or(Value::Null),
            )
        })
        .collect()
}

/// Per-check series of outputs across the full history (any scope), driving
/// the `outputs_history[name]` namespace in routing expressions.
pub fn history_outputs(journal: &ExecutionJournal, snapshot: Snapshot) -> Map<String, Value> {
    let mut history: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for entry in journal.read_visible(journal.session_id(), snapshot, None) {
        history
            .entry(entry.check_id.clone())
            .or_default()
            .push(entry.result.output.clone().unwrap_or(Value::Null));
    }
    history
        .into_iter()
        .map(|(name, outputs)| (name, Value::Array(outputs)))
        .collect()
}
