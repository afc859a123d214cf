use std::collections::HashMap;

use serde_json::Value;

/// Routing-specific knobs.
#[derive(Clone, Debug)]
pub struct RoutingConfig {
    /// Caps total forward-run emissions (`run`, `run_js`, `goto`, `goto_js`,
    /// `retry`) per run. The emission past the cap records a
    /// `routing/loop_budget_exceeded` issue instead.
    pub max_loops: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { max_loops: 10 }
    }
}

/// Engine-level configuration, immutable for the lifetime of a run.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upper bound on concurrent provider invocations.
    pub max_parallelism: usize,
    /// Clear the remaining level queue as soon as any check fails fatally.
    pub fail_fast: bool,
    pub debug: bool,
    /// Applied to provider calls without a per-check `timeout_ms`.
    pub default_timeout_ms: u64,
    pub routing: RoutingConfig,
    /// Run-level policy predicate, evaluated before each check's own
    /// `fail_if`. Violations carry the reserved `global_fail_if` rule id.
    pub fail_if: Option<String>,
    /// Named schema validators referenced by `schema: "<id>"` declarations.
    pub schemas: HashMap<String, Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 10,
            fail_fast: false,
            debug: false,
            default_timeout_ms: 600_000,
            routing: RoutingConfig::default(),
            fail_if: None,
            schemas: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn max_parallelism(mut self, limit: usize) -> Self {
        self.max_parallelism = limit.max(1);
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    pub fn max_loops(mut self, max_loops: u32) -> Self {
        self.routing.max_loops = max_loops;
        self
    }

    pub fn default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn global_fail_if(mut self, expr: impl Into<String>) -> Self {
        self.fail_if = Some(expr.into());
        self
    }

    pub fn schema(mut self, id: impl Into<String>, schema: Value) -> Self {
        self.schemas.insert(id.into(), schema);
        self
    }
}
