//! The provider seam: checks carry an opaque `type` tag and providers form a
//! flat registry keyed by that tag. There is deliberately no hierarchy over
//! checks or providers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use cascade_types::{CheckResult, FanoutMode, Scope};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::evaluator::ForEachInfo;

/// Provider tags whose outputs aggregate rather than map: a dependent of a
/// forEach parent with one of these tags defaults to a single reduce-style
/// execution over the full aggregate.
const AGGREGATOR_TAGS: &[&str] = &["script", "memory", "log", "workflow", "noop"];

/// Default fanout for a provider tag when neither the check config nor a
/// registered provider says otherwise.
pub fn infer_fanout(check_type: &str) -> FanoutMode {
    if AGGREGATOR_TAGS.contains(&check_type) {
        FanoutMode::Reduce
    } else {
        FanoutMode::Map
    }
}

/// Everything a provider sees for one invocation.
///
/// `payload` is the check's provider-specific configuration; `dependencies`
/// is the rendered view of upstream results (per-item for mappers);
/// `execution_context` is the opaque bag the run was started with.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub check_id: String,
    pub payload: Value,
    pub dependencies: BTreeMap<String, CheckResult>,
    pub event: String,
    pub execution_context: Value,
    pub scope: Scope,
    pub for_each: Option<ForEachInfo>,
    /// Cooperative cancellation, derived from the run-level context.
    pub cancellation: CancellationToken,
}

/// An external worker executing one check.
///
/// Fatal issues in the returned result (see rule-id classification) signal
/// execution failure; an `Err` is treated as a `<check>/error` failure. The
/// engine imposes the timeout; providers only need to honor the token.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn execute(&self, request: ProviderRequest) -> anyhow::Result<CheckResult>;

    /// How dependents of a forEach parent consume items by default when the
    /// dependent carries this provider's tag.
    fn default_fanout(&self) -> FanoutMode {
        FanoutMode::Map
    }
}

/// Flat provider registry keyed by check type tag.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(tag.into(), provider);
    }

    pub fn with(mut self, tag: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register(tag, provider);
        self
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(tag).cloned()
    }

    /// Resolve the default fanout for `tag`: a registered provider's
    /// preference, else inference from the tag name.
    pub fn default_fanout_for(&self, tag: &str) -> FanoutMode {
        self.providers
            .get(tag)
            .map(|provider| provider.default_fanout())
            .unwrap_or_else(|| infer_fanout(tag))
    }
}
