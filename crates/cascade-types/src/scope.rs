use crate::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_FANOUT_DEPTH: usize = 16;

/// One forEach branch step: the parent check that fanned out, and the item index taken.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeSegment {
    pub check_id: String,
    pub index: usize,
}

/// Ordered list of `(check, index)` pairs identifying a forEach branch.
///
/// The root scope is the empty list and names the aggregate view of a check.
/// Equality is element-wise, so a scope doubles as a journal lookup key.
///
/// Display: `"fetch[0]/normalize[2]"`; the root scope renders as `"root"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope(Vec<ScopeSegment>);

impl Scope {
    /// The root (aggregate) scope.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Single-segment scope for item `index` of forEach parent `check_id`.
    pub fn item(check_id: impl Into<String>, index: usize) -> Self {
        Self(vec![ScopeSegment {
            check_id: check_id.into(),
            index,
        }])
    }

    /// Derive a child scope one fanout level deeper.
    ///
    /// Returns `Err(MaxFanoutDepthExceeded)` once `MAX_FANOUT_DEPTH` segments
    /// are reached, which bounds pathological nested-forEach configurations.
    pub fn child(&self, check_id: impl Into<String>, index: usize) -> Result<Self, DomainError> {
        if self.0.len() >= MAX_FANOUT_DEPTH {
            return Err(DomainError::MaxFanoutDepthExceeded {
                max: MAX_FANOUT_DEPTH,
            });
        }
        let mut segments = self.0.clone();
        segments.push(ScopeSegment {
            check_id: check_id.into(),
            index,
        });
        Ok(Self(segments))
    }

    /// The enclosing scope (one fanout level up), or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        let mut segments = self.0.clone();
        segments.pop();
        Some(Self(segments))
    }

    /// Whether this is the root (aggregate) scope.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Fanout nesting depth (0 at the root).
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// The innermost segment, or `None` at the root.
    pub fn leaf(&self) -> Option<&ScopeSegment> {
        self.0.last()
    }

    pub fn segments(&self) -> &[ScopeSegment] {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "root");
        }
        for (i, seg) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}[{}]", seg.check_id, seg.index)?;
        }
        Ok(())
    }
}
