//! End-to-end runs through the engine with stub providers and a
//! literal-minded condition evaluator.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cascade_engine::{
    ConditionEvaluator, ConditionScope, Engine, EngineConfig, EvalError, ExecutionRequest,
    Provider, ProviderRegistry, ProviderRequest, RoutingScope,
};
use cascade_types::{
    CheckConfig, CheckResult, EngineEvent, EngineState, FanoutMode, RetryPolicy, RoutingBlock,
    SkipReason, TransitionRule,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

// ── Test doubles ──

/// Evaluates the tiny expression language the test configs use:
/// `true`/`false`, `has:<name>` (a non-null previous result exists),
/// `run:<a>,<b>` target lists, and `goto:<id>` targets.
struct StubEvaluator;

impl ConditionEvaluator for StubEvaluator {
    fn eval_bool(&self, expr: &str, scope: &ConditionScope) -> Result<bool, EvalError> {
        match expr {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => {
                if let Some(name) = expr.strip_prefix("has:") {
                    return Ok(scope
                        .previous_results
                        .get(name)
                        .is_some_and(|value| !value.is_null()));
                }
                Err(EvalError::new(format!("unknown expression '{expr}'")))
            }
        }
    }

    fn eval_routing_bool(&self, expr: &str, scope: &RoutingScope) -> Result<bool, EvalError> {
        match expr {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => {
                if let Some(name) = expr.strip_prefix("has:") {
                    return Ok(scope
                        .outputs
                        .get(name)
                        .is_some_and(|value| !value.is_null()));
                }
                Err(EvalError::new(format!("unknown expression '{expr}'")))
            }
        }
    }

    fn eval_targets(&self, expr: &str, _: &RoutingScope) -> Result<Vec<String>, EvalError> {
        Ok(expr
            .strip_prefix("run:")
            .map(|list| list.split(',').map(str::to_string).collect())
            .unwrap_or_default())
    }

    fn eval_target(&self, expr: &str, _: &RoutingScope) -> Result<Option<String>, EvalError> {
        Ok(expr.strip_prefix("goto:").map(str::to_string))
    }
}

type Behavior = dyn Fn(ProviderRequest) -> anyhow::Result<CheckResult> + Send + Sync;

struct TestProvider {
    fanout: FanoutMode,
    delay_ms: u64,
    behavior: Arc<Behavior>,
}

#[async_trait]
impl Provider for TestProvider {
    async fn execute(&self, request: ProviderRequest) -> anyhow::Result<CheckResult> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        (self.behavior)(request)
    }

    fn default_fanout(&self) -> FanoutMode {
        self.fanout
    }
}

fn provider<F>(behavior: F) -> Arc<dyn Provider>
where
    F: Fn(ProviderRequest) -> anyhow::Result<CheckResult> + Send + Sync + 'static,
{
    Arc::new(TestProvider {
        fanout: FanoutMode::Map,
        delay_ms: 0,
        behavior: Arc::new(behavior),
    })
}

fn reduce_provider<F>(behavior: F) -> Arc<dyn Provider>
where
    F: Fn(ProviderRequest) -> anyhow::Result<CheckResult> + Send + Sync + 'static,
{
    Arc::new(TestProvider {
        fanout: FanoutMode::Reduce,
        delay_ms: 0,
        behavior: Arc::new(behavior),
    })
}

/// Records check ids in completion order and succeeds with `{"ok": true}`.
fn recording_provider(log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Provider> {
    provider(move |request| {
        log.lock().unwrap().push(request.check_id.clone());
        Ok(CheckResult::with_output(json!({"ok": true})))
    })
}

/// Tracks concurrent executions and the observed maximum.
struct GaugeProvider {
    current: Arc<AtomicI64>,
    max: Arc<AtomicI64>,
}

#[async_trait]
impl Provider for GaugeProvider {
    async fn execute(&self, _request: ProviderRequest) -> anyhow::Result<CheckResult> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(CheckResult::with_output(json!(true)))
    }
}

fn engine(config: EngineConfig, checks: Vec<CheckConfig>, registry: ProviderRegistry) -> Engine {
    Engine::new(config, checks, registry, Arc::new(StubEvaluator))
}

// ── Seed scenarios ──

#[test_log::test(tokio::test)]
async fn linear_chain_executes_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ProviderRegistry::new().with("command", recording_provider(log.clone()));
    let checks = vec![
        CheckConfig::new("a", "command"),
        CheckConfig::new("b", "command").depends_on(["a"]),
        CheckConfig::new("c", "command").depends_on(["b"]),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(result.metadata.final_state, EngineState::Completed);
    assert_eq!(result.metadata.waves, 3);
    assert!(result.issues.is_empty());
    for name in ["a", "b", "c"] {
        let stats = result.statistics.get(name).unwrap();
        assert_eq!(stats.successful_runs, 1);
        assert_eq!(stats.total_runs, 1);
        assert!(!stats.skipped);
    }
}

#[test_log::test(tokio::test)]
async fn parallel_level_respects_max_parallelism() {
    let current = Arc::new(AtomicI64::new(0));
    let max = Arc::new(AtomicI64::new(0));
    let registry = ProviderRegistry::new().with(
        "command",
        Arc::new(GaugeProvider {
            current: current.clone(),
            max: max.clone(),
        }) as Arc<dyn Provider>,
    );
    let checks = vec![
        CheckConfig::new("a", "command"),
        CheckConfig::new("b", "command"),
        CheckConfig::new("c", "command"),
    ];

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let result = engine(
        EngineConfig::default().max_parallelism(2),
        checks,
        registry,
    )
    .with_event_sink(tx)
    .execute(ExecutionRequest::new("manual"))
    .await
    .unwrap();

    assert_eq!(result.metadata.final_state, EngineState::Completed);
    for name in ["a", "b", "c"] {
        assert_eq!(result.statistics.get(name).unwrap().successful_runs, 1);
    }
    assert!(max.load(Ordering::SeqCst) <= 2, "parallelism exceeded bound");

    // At most 2 CheckScheduled overlap without an intervening CheckCompleted.
    let mut in_flight = 0i64;
    let mut max_in_flight = 0i64;
    while let Ok(event) = rx.try_recv() {
        match event {
            EngineEvent::CheckScheduled { .. } => {
                in_flight += 1;
                max_in_flight = max_in_flight.max(in_flight);
            }
            EngineEvent::CheckCompleted { .. } => in_flight -= 1,
            _ => {}
        }
    }
    assert!(max_in_flight <= 2, "observed {max_in_flight} overlapping schedules");
}

#[test_log::test(tokio::test)]
async fn cycle_is_rejected_without_dispatch() {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    let registry = ProviderRegistry::new().with(
        "command",
        provider(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(CheckResult::new())
        }),
    );
    let checks = vec![
        CheckConfig::new("a", "command").depends_on(["b"]),
        CheckConfig::new("b", "command").depends_on(["a"]),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    assert_eq!(result.metadata.final_state, EngineState::Completed);
    assert_eq!(result.metadata.waves, 0);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert_eq!(result.issues.len(), 1);
    assert_eq!(result.issues[0].rule_id, "system/error");
    assert!(result.issues[0].message.contains("cycle"));
}

#[test_log::test(tokio::test)]
async fn for_each_fans_out_one_execution_per_item() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_process = seen.clone();
    let registry = ProviderRegistry::new()
        .with(
            "http",
            provider(|_| Ok(CheckResult::with_output(json!([{"id": 1}, {"id": 2}])))),
        )
        .with(
            "command",
            provider(move |request| {
                let dep = request.dependencies.get("fetch").cloned().unwrap_or_default();
                seen_by_process
                    .lock()
                    .unwrap()
                    .push((request.scope.to_string(), dep.output.unwrap_or(Value::Null)));
                Ok(CheckResult::with_output(json!("done")))
            }),
        );
    let checks = vec![
        CheckConfig::new("fetch", "http").for_each(true),
        CheckConfig::new("process", "command").depends_on(["fetch"]),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    assert_eq!(result.metadata.final_state, EngineState::Completed);
    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            ("fetch[0]".to_string(), json!({"id": 1})),
            ("fetch[1]".to_string(), json!({"id": 2})),
        ]
    );
    let stats = result.statistics.get("process").unwrap();
    assert_eq!(stats.total_runs, 2);
    assert_eq!(stats.successful_runs, 2);
    assert_eq!(
        stats.per_iteration_duration_ms.as_ref().map(Vec::len),
        Some(2)
    );
}

#[test_log::test(tokio::test)]
async fn goto_loop_stops_at_loop_budget() {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    let registry = ProviderRegistry::new().with(
        "command",
        provider(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(CheckResult::with_output(json!("again")))
        }),
    );
    let checks = vec![CheckConfig::new("a", "command").on_success(RoutingBlock {
        goto: Some("a".into()),
        ..RoutingBlock::default()
    })];

    let result = engine(EngineConfig::default().max_loops(3), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    // Initial run plus three budgeted forward runs.
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(result.statistics.get("a").unwrap().total_runs, 4);
    assert_eq!(result.metadata.final_state, EngineState::Completed);
    assert!(
        result
            .issues
            .iter()
            .any(|issue| issue.rule_id == "a/routing/loop_budget_exceeded"),
        "missing loop budget issue: {:?}",
        result.issues
    );
}

#[test_log::test(tokio::test)]
async fn for_each_retry_redispatches_only_failed_iteration() {
    let executed = Arc::new(Mutex::new(Vec::new()));
    let executed_in_process = executed.clone();
    let b_failures = Arc::new(AtomicU32::new(0));
    let failures = b_failures.clone();

    let registry = ProviderRegistry::new()
        .with(
            "http",
            provider(|_| Ok(CheckResult::with_output(json!(["a", "b", "c"])))),
        )
        .with(
            "command",
            provider(move |request| {
                let item = request
                    .for_each
                    .as_ref()
                    .map(|info| info.item.clone())
                    .unwrap_or(Value::Null);
                let label = item.as_str().unwrap_or("?").to_string();
                executed_in_process.lock().unwrap().push(label.clone());
                if label == "b" && failures.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(CheckResult::fatal(
                        format!("{}/error", request.check_id),
                        "iteration failed",
                    ))
                } else {
                    Ok(CheckResult::with_output(json!(format!("{label}-done"))))
                }
            }),
        );
    let checks = vec![
        CheckConfig::new("fetch", "http").for_each(true),
        CheckConfig::new("process", "command")
            .depends_on(["fetch"])
            .on_fail(RoutingBlock {
                retry: Some(RetryPolicy {
                    max: 2,
                    backoff: Default::default(),
                }),
                ..RoutingBlock::default()
            }),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    // Iterations a and c run once; only b is re-dispatched.
    assert_eq!(*executed.lock().unwrap(), vec!["a", "b", "c", "b", "b"]);
    let stats = result.statistics.get("process").unwrap();
    assert_eq!(stats.total_runs, 5);
    assert_eq!(stats.successful_runs, 3);
    assert_eq!(stats.failed_runs, 2);
    assert!(stats.retry_attempts <= 2);
    // The final merged aggregate carries no execution failures.
    assert!(result.fatal_issues().is_empty(), "{:?}", result.issues);
    assert_eq!(result.metadata.final_state, EngineState::Completed);
}

// ── Gating and skips ──

#[test_log::test(tokio::test)]
async fn false_if_condition_skips_without_invocation() {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    let registry = ProviderRegistry::new().with(
        "command",
        provider(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(CheckResult::new())
        }),
    );
    let checks = vec![CheckConfig::new("gated", "command").if_expr("false")];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    let stats = result.statistics.get("gated").unwrap();
    assert!(stats.skipped);
    assert_eq!(stats.skip_reason, Some(SkipReason::IfCondition));
    assert_eq!(stats.total_runs, 0);
    assert!(
        result
            .issues
            .iter()
            .any(|issue| issue.rule_id == "gated/__skipped")
    );
}

#[test_log::test(tokio::test)]
async fn failed_dependency_cascades_skip() {
    let registry = ProviderRegistry::new().with(
        "command",
        provider(|request| {
            if request.check_id == "a" {
                Ok(CheckResult::fatal("a/error", "boom"))
            } else {
                Ok(CheckResult::new())
            }
        }),
    );
    let checks = vec![
        CheckConfig::new("a", "command"),
        CheckConfig::new("b", "command").depends_on(["a"]),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    let stats = result.statistics.get("b").unwrap();
    assert!(stats.skipped);
    assert_eq!(stats.skip_reason, Some(SkipReason::DependencyFailed));
    assert_eq!(stats.total_runs, 0);
    assert_eq!(stats.retry_attempts, 0);
}

#[test_log::test(tokio::test)]
async fn continue_on_failure_satisfies_dependents() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let inner = log.clone();
    let registry = ProviderRegistry::new().with(
        "command",
        provider(move |request| {
            inner.lock().unwrap().push(request.check_id.clone());
            if request.check_id == "a" {
                Ok(CheckResult::fatal("a/error", "boom"))
            } else {
                Ok(CheckResult::new())
            }
        }),
    );
    let checks = vec![
        CheckConfig::new("a", "command").continue_on_failure(true),
        CheckConfig::new("b", "command").depends_on(["a"]),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    assert_eq!(result.statistics.get("b").unwrap().successful_runs, 1);
}

#[test_log::test(tokio::test)]
async fn or_dependency_is_stable_under_reordering() {
    for token in ["a|b", "b|a"] {
        let registry = ProviderRegistry::new().with(
            "command",
            provider(|request| {
                if request.check_id == "a" {
                    Ok(CheckResult::fatal("a/error", "boom"))
                } else {
                    Ok(CheckResult::with_output(json!("ok")))
                }
            }),
        );
        let checks = vec![
            CheckConfig::new("a", "command"),
            CheckConfig::new("b", "command"),
            CheckConfig::new("c", "command").depends_on([token]),
        ];

        let result = engine(EngineConfig::default(), checks, registry)
            .execute(ExecutionRequest::new("manual"))
            .await
            .unwrap();

        let stats = result.statistics.get("c").unwrap();
        assert_eq!(stats.successful_runs, 1, "token {token}");
        assert!(!stats.skipped, "token {token}");
    }
}

#[test_log::test(tokio::test)]
async fn false_assume_skips_without_consuming_retries() {
    let registry = ProviderRegistry::new().with("command", provider(|_| Ok(CheckResult::new())));
    let checks = vec![
        CheckConfig::new("a", "command"),
        {
            let mut check = CheckConfig::new("b", "command").depends_on(["a"]);
            check.assume = Some("has:missing".into());
            check.retry = Some(RetryPolicy {
                max: 3,
                backoff: Default::default(),
            });
            check
        },
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    let stats = result.statistics.get("b").unwrap();
    assert!(stats.skipped);
    assert_eq!(stats.skip_reason, Some(SkipReason::Assume));
    assert_eq!(stats.retry_attempts, 0);
}

#[test_log::test(tokio::test)]
async fn empty_for_each_skips_mapper_but_not_reducer() {
    let registry = ProviderRegistry::new()
        .with("http", provider(|_| Ok(CheckResult::with_output(json!([])))))
        .with("command", provider(|_| Ok(CheckResult::new())))
        .with(
            "script",
            reduce_provider(|_| Ok(CheckResult::with_output(json!("summary")))),
        );
    let checks = vec![
        CheckConfig::new("fetch", "http").for_each(true),
        CheckConfig::new("mapper", "command").depends_on(["fetch"]),
        CheckConfig::new("reducer", "script").depends_on(["fetch"]),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    let mapper = result.statistics.get("mapper").unwrap();
    assert!(mapper.skipped);
    assert_eq!(mapper.skip_reason, Some(SkipReason::ForEachEmpty));
    assert_eq!(result.statistics.get("reducer").unwrap().successful_runs, 1);
}

#[test_log::test(tokio::test)]
async fn for_each_without_array_output_is_execution_error() {
    let registry = ProviderRegistry::new()
        .with("http", provider(|_| Ok(CheckResult::new())))
        .with("command", provider(|_| Ok(CheckResult::new())));
    let checks = vec![
        CheckConfig::new("fetch", "http").for_each(true),
        CheckConfig::new("process", "command").depends_on(["fetch"]),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    assert!(
        result
            .issues
            .iter()
            .any(|issue| issue.rule_id == "forEach/execution_error")
    );
    let process = result.statistics.get("process").unwrap();
    assert!(process.skipped);
    assert_eq!(process.skip_reason, Some(SkipReason::DependencyFailed));
}

// ── Routing behaviors ──

#[test_log::test(tokio::test)]
async fn null_transition_is_explicit_noop() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ProviderRegistry::new().with("command", recording_provider(log.clone()));
    let checks = vec![
        CheckConfig::new("a", "command").on_success(RoutingBlock {
            transitions: vec![TransitionRule {
                when: "true".into(),
                to: None,
            }],
            goto: Some("b".into()),
            ..RoutingBlock::default()
        }),
        CheckConfig::new("b", "command").depends_on(["a"]).if_expr("false"),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    // Only a ran; the matched null transition suppressed the goto and no
    // retry wave was requested for it.
    assert_eq!(*log.lock().unwrap(), vec!["a"]);
    assert_eq!(result.statistics.get("a").unwrap().total_runs, 1);
}

#[test_log::test(tokio::test)]
async fn forward_run_preempts_remaining_levels() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ProviderRegistry::new().with("command", recording_provider(log.clone()));
    let checks = vec![
        CheckConfig::new("a", "command").on_success(RoutingBlock {
            run: vec!["b".into()],
            ..RoutingBlock::default()
        }),
        CheckConfig::new("b", "command").depends_on(["a"]),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    // The forward run executes b before its natural level does.
    assert_eq!(*log.lock().unwrap(), vec!["a", "b", "b"]);
    assert_eq!(result.statistics.get("b").unwrap().total_runs, 2);
    assert_eq!(result.metadata.waves, 3);
}

#[test_log::test(tokio::test)]
async fn run_js_schedules_dynamic_targets() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ProviderRegistry::new().with("command", recording_provider(log.clone()));
    let checks = vec![
        CheckConfig::new("a", "command").on_success(RoutingBlock {
            run_js: Some("run:b".into()),
            ..RoutingBlock::default()
        }),
        CheckConfig::new("b", "command").depends_on(["a"]),
    ];

    engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    assert_eq!(log.lock().unwrap().first().map(String::as_str), Some("a"));
    assert!(log.lock().unwrap().iter().filter(|id| *id == "b").count() >= 1);
}

#[test_log::test(tokio::test)]
async fn global_fail_if_flips_branch_and_cascades() {
    let registry = ProviderRegistry::new().with(
        "command",
        provider(|_| Ok(CheckResult::with_output(json!("done")))),
    );
    let checks = vec![
        CheckConfig::new("a", "command"),
        CheckConfig::new("b", "command").depends_on(["a"]),
    ];

    let result = engine(
        EngineConfig::default().global_fail_if("true"),
        checks,
        registry,
    )
    .execute(ExecutionRequest::new("manual"))
    .await
    .unwrap();

    assert!(
        result
            .issues
            .iter()
            .any(|issue| issue.rule_id == "global_fail_if")
    );
    let b = result.statistics.get("b").unwrap();
    assert!(b.skipped);
    assert_eq!(b.skip_reason, Some(SkipReason::DependencyFailed));
}

// ── Contracts ──

#[test_log::test(tokio::test)]
async fn guarantee_violation_is_non_fatal() {
    let registry = ProviderRegistry::new().with(
        "command",
        provider(|_| Ok(CheckResult::with_output(json!(42)))),
    );
    let checks = vec![{
        let mut check = CheckConfig::new("a", "command");
        check.guarantee = Some("false".into());
        check
    }];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    assert!(
        result
            .issues
            .iter()
            .any(|issue| issue.rule_id == "contract/guarantee_failed")
    );
    assert!(result.fatal_issues().is_empty());
    assert_eq!(result.statistics.get("a").unwrap().successful_runs, 1);
}

#[test_log::test(tokio::test)]
async fn schema_violation_is_non_fatal() {
    let registry = ProviderRegistry::new().with(
        "command",
        provider(|_| Ok(CheckResult::with_output(json!({"status": "ok"})))),
    );
    let checks = vec![{
        let mut check = CheckConfig::new("a", "command");
        check.schema = Some(cascade_types::SchemaSpec::Inline(json!({
            "type": "object",
            "required": ["status", "url"],
        })));
        check
    }];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    assert!(
        result
            .issues
            .iter()
            .any(|issue| issue.rule_id == "contract/schema_validation_failed")
    );
    assert_eq!(result.statistics.get("a").unwrap().successful_runs, 1);
}

#[test_log::test(tokio::test)]
async fn provider_timeout_is_an_execution_error() {
    let registry = ProviderRegistry::new().with(
        "command",
        Arc::new(TestProvider {
            fanout: FanoutMode::Map,
            delay_ms: 5_000,
            behavior: Arc::new(|_| Ok(CheckResult::new())),
        }) as Arc<dyn Provider>,
    );
    let checks = vec![{
        let mut check = CheckConfig::new("slow", "command");
        check.timeout_ms = Some(50);
        check
    }];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    assert!(
        result
            .issues
            .iter()
            .any(|issue| issue.rule_id == "slow/execution_error")
    );
    assert_eq!(result.statistics.get("slow").unwrap().failed_runs, 1);
}

// ── Sessions, suspension, shutdown ──

#[test_log::test(tokio::test)]
async fn session_members_are_serialized() {
    let current = Arc::new(AtomicI64::new(0));
    let max = Arc::new(AtomicI64::new(0));
    let registry = ProviderRegistry::new().with(
        "ai",
        Arc::new(GaugeProvider {
            current: current.clone(),
            max: max.clone(),
        }) as Arc<dyn Provider>,
    );
    let checks = vec![
        CheckConfig::new("ask", "ai").session("chat"),
        CheckConfig::new("refine", "ai").session("chat"),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    assert_eq!(result.metadata.final_state, EngineState::Completed);
    assert_eq!(max.load(Ordering::SeqCst), 1, "session members overlapped");
}

#[test_log::test(tokio::test)]
async fn awaiting_human_input_suspends_the_run() {
    let registry = ProviderRegistry::new().with(
        "chat",
        provider(|_| {
            let mut result = CheckResult::with_output(json!("waiting for reply"));
            result.awaiting_human_input = true;
            Ok(result)
        }),
    );
    let checks = vec![
        CheckConfig::new("ask", "chat"),
        CheckConfig::new("followup", "chat").depends_on(["ask"]),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("chat_message"))
        .await
        .unwrap();

    assert_eq!(result.metadata.final_state, EngineState::Completed);
    assert_eq!(result.metadata.waves, 1);
    assert!(result.statistics.get("followup").is_none());
}

#[test_log::test(tokio::test)]
async fn fail_fast_clears_remaining_levels() {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    let registry = ProviderRegistry::new().with(
        "command",
        provider(move |request| {
            counter.fetch_add(1, Ordering::SeqCst);
            if request.check_id == "a" {
                Ok(CheckResult::fatal("a/error", "boom"))
            } else {
                Ok(CheckResult::new())
            }
        }),
    );
    // With fail-fast the later levels are cleared outright: b and late end
    // the run unreferenced instead of skipped.
    let checks = vec![
        CheckConfig::new("a", "command"),
        CheckConfig::new("b", "command").depends_on(["a"]).continue_on_failure(false),
        CheckConfig::new("late", "command").depends_on(["b|a"]),
    ];

    let result = engine(EngineConfig::default().fail_fast(true), checks, registry)
        .execute(ExecutionRequest::new("manual"))
        .await
        .unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(result.statistics.get("late").is_none());
}

#[test_log::test(tokio::test)]
async fn cancellation_transitions_to_error() {
    let registry = ProviderRegistry::new().with("command", provider(|_| Ok(CheckResult::new())));
    let checks = vec![CheckConfig::new("a", "command")];
    let token = CancellationToken::new();
    token.cancel();

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual").cancellation(token))
        .await
        .unwrap();

    assert_eq!(result.metadata.final_state, EngineState::Error);
    assert!(
        result
            .issues
            .iter()
            .any(|issue| issue.rule_id == "system/error" && issue.message.contains("cancelled"))
    );
}

#[test_log::test(tokio::test)]
async fn subset_request_expands_transitively() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ProviderRegistry::new().with("command", recording_provider(log.clone()));
    let checks = vec![
        CheckConfig::new("base", "command"),
        CheckConfig::new("mid", "command").depends_on(["base"]),
        CheckConfig::new("top", "command").depends_on(["mid"]),
        CheckConfig::new("unrelated", "command"),
    ];

    let result = engine(EngineConfig::default(), checks, registry)
        .execute(ExecutionRequest::new("manual").checks(["top"]))
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["base", "mid", "top"]);
    assert!(result.statistics.get("unrelated").is_none());
}

#[test_log::test(tokio::test)]
async fn deterministic_runs_produce_identical_results() {
    async fn run_once() -> cascade_types::ExecutionResult {
        let registry = ProviderRegistry::new()
            .with(
                "http",
                provider(|_| Ok(CheckResult::with_output(json!([1, 2])))),
            )
            .with(
                "command",
                provider(|request| {
                    let item = request
                        .for_each
                        .as_ref()
                        .map(|info| info.item.clone())
                        .unwrap_or(Value::Null);
                    Ok(CheckResult::with_output(item))
                }),
            );
        let checks = vec![
            CheckConfig::new("fetch", "http").for_each(true),
            CheckConfig::new("process", "command").depends_on(["fetch"]),
        ];
        engine(EngineConfig::default(), checks, registry)
            .execute(ExecutionRequest::new("manual").session_id("fixed"))
            .await
            .unwrap()
    }

    let mut first = run_once().await;
    let mut second = run_once().await;
    // Identical modulo timing.
    first.metadata.duration_ms = 0;
    second.metadata.duration_ms = 0;
    for result in [&mut first, &mut second] {
        for stats in &mut result.statistics.checks {
            stats.total_duration_ms = 0;
            stats.per_iteration_duration_ms = None;
        }
    }
    similar_asserts::assert_eq!(first, second);
}
