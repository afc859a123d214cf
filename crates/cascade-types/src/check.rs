use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a check consumes a forEach parent's items.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutMode {
    /// One execution per parent item, each at its own per-item scope.
    Map,
    /// A single execution consuming the full aggregate at root scope.
    Reduce,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffMode {
    Fixed,
    Exponential,
}

/// Advisory retry backoff. The engine computes the delay and records it on
/// the forward-run event; actual timing is the scheduler's prerogative.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub mode: BackoffMode,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            mode: BackoffMode::Fixed,
            delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry attempt `attempt` (1-based).
    ///
    /// Fixed mode always returns `delay_ms`; exponential doubles per attempt,
    /// capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        match self.mode {
            BackoffMode::Fixed => self.delay_ms.min(self.max_delay_ms),
            BackoffMode::Exponential => {
                let shift = attempt.saturating_sub(1).min(63);
                let delay = self.delay_ms.saturating_mul(1u64 << shift);
                delay.min(self.max_delay_ms)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

/// One declarative routing rule: `when` is an expression evaluated in the
/// routing context; `to = None` is an explicit no-op that still overrides
/// any `goto`/`goto_js` in the same block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    pub when: String,
    #[serde(default)]
    pub to: Option<String>,
}

/// A routing block (`on_success`, `on_fail`, or `on_finish`).
///
/// Processing order within a block: `run`, `run_js`, `retry`, then either
/// `transitions` (first match wins) or, when no transitions are declared,
/// `goto_js` followed by `goto`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingBlock {
    #[serde(default)]
    pub run: Vec<String>,
    #[serde(default)]
    pub run_js: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub transitions: Vec<TransitionRule>,
    #[serde(default)]
    pub goto_js: Option<String>,
    #[serde(default)]
    pub goto: Option<String>,
    /// Overrides the trigger event seen by checks scheduled from this block.
    #[serde(default)]
    pub goto_event: Option<String>,
}

/// Checks executed once before a forEach loop; their outputs are merged into
/// every iteration's dependency map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitBlock {
    #[serde(default)]
    pub run: Vec<String>,
}

/// Output schema declaration: a named validator id or an inline schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaSpec {
    Named(String),
    Inline(Value),
}

/// Static configuration of one check.
///
/// `check_type` tags the provider that does the actual work; everything the
/// provider needs beyond engine-level fields travels in the opaque `payload`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub check_type: String,
    /// Dependency tokens; `"a|b"` declares an OR group over `{a, b}`.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, rename = "if")]
    pub if_expr: Option<String>,
    #[serde(default)]
    pub assume: Option<String>,
    #[serde(default)]
    pub guarantee: Option<String>,
    #[serde(default)]
    pub fail_if: Option<String>,
    #[serde(default)]
    pub for_each: bool,
    /// Defaults to the provider's preference when unset.
    #[serde(default)]
    pub fanout: Option<FanoutMode>,
    #[serde(default)]
    pub on_success: Option<RoutingBlock>,
    #[serde(default)]
    pub on_fail: Option<RoutingBlock>,
    #[serde(default)]
    pub on_finish: Option<RoutingBlock>,
    #[serde(default)]
    pub on_init: Option<InitBlock>,
    /// Fallback retry policy applied when a failure branch has none.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub schema: Option<SchemaSpec>,
    /// Checks sharing a session run sequentially relative to each other.
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Provider-specific configuration (prompt, exec, url, ...).
    #[serde(default)]
    pub payload: Value,
}

impl CheckConfig {
    pub fn new(id: impl Into<String>, check_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            check_type: check_type.into(),
            depends_on: Vec::new(),
            if_expr: None,
            assume: None,
            guarantee: None,
            fail_if: None,
            for_each: false,
            fanout: None,
            on_success: None,
            on_fail: None,
            on_finish: None,
            on_init: None,
            retry: None,
            continue_on_failure: false,
            schema: None,
            session: None,
            group: None,
            tags: Vec::new(),
            timeout_ms: None,
            payload: Value::Null,
        }
    }

    pub fn depends_on<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = tokens.into_iter().map(Into::into).collect();
        self
    }

    pub fn if_expr(mut self, expr: impl Into<String>) -> Self {
        self.if_expr = Some(expr.into());
        self
    }

    pub fn fail_if(mut self, expr: impl Into<String>) -> Self {
        self.fail_if = Some(expr.into());
        self
    }

    pub fn for_each(mut self, enabled: bool) -> Self {
        self.for_each = enabled;
        self
    }

    pub fn fanout(mut self, mode: FanoutMode) -> Self {
        self.fanout = Some(mode);
        self
    }

    pub fn on_success(mut self, block: RoutingBlock) -> Self {
        self.on_success = Some(block);
        self
    }

    pub fn on_fail(mut self, block: RoutingBlock) -> Self {
        self.on_fail = Some(block);
        self
    }

    pub fn on_finish(mut self, block: RoutingBlock) -> Self {
        self.on_finish = Some(block);
        self
    }

    pub fn continue_on_failure(mut self, enabled: bool) -> Self {
        self.continue_on_failure = enabled;
        self
    }

    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }
}
