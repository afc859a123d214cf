use std::collections::BTreeMap;

use cascade_types::{CheckResult, JournalEntry, Scope};

use crate::error::JournalError;

/// Opaque marker for a consistent read view over the journal.
///
/// A snapshot taken before a batch of writes makes those writes invisible to
/// readers holding it; two readers with the same snapshot observe identical
/// data regardless of interleaved commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Snapshot(usize);

impl Snapshot {
    /// Number of entries visible under this snapshot.
    pub fn visible_len(&self) -> usize {
        self.0
    }
}

/// Append-only log of check results for one run, scoped by forEach index.
///
/// The journal does no cross-entry merging; readers reassemble per-item views
/// from aggregated forEach parents. Multiple entries per `(check_id, scope)`
/// are allowed — the latest wins for point reads and the full series is the
/// check's history.
///
/// Writes come only from the runner (single-writer); readers use snapshot
/// markers and are never blocked by writers.
#[derive(Clone, Debug, Default)]
pub struct ExecutionJournal {
    session_id: String,
    entries: Vec<JournalEntry>,
}

impl ExecutionJournal {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry. Entries from a different session are rejected; the
    /// journal is scoped to exactly one run.
    pub fn commit_entry(&mut self, entry: JournalEntry) -> Result<(), JournalError> {
        if entry.session_id != self.session_id {
            return Err(JournalError::SessionMismatch {
                expected: self.session_id.clone(),
                actual: entry.session_id,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Begin a consistent read view covering all entries committed so far.
    pub fn begin_snapshot(&self) -> Snapshot {
        Snapshot(self.entries.len())
    }

    /// A snapshot covering the full journal, for readers that always want the
    /// latest data.
    pub fn latest_snapshot(&self) -> Snapshot {
        self.begin_snapshot()
    }

    fn visible(&self, snapshot: Snapshot) -> &[JournalEntry] {
        let bound = snapshot.0.min(self.entries.len());
        &self.entries[..bound]
    }

    /// All visible entries for `session_id`, optionally filtered by trigger
    /// event. Scan complexity: O(n).
    pub fn read_visible(
        &self,
        session_id: &str,
        snapshot: Snapshot,
        event_filter: Option<&str>,
    ) -> Vec<&JournalEntry> {
        self.visible(snapshot)
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .filter(|entry| event_filter.is_none_or(|event| entry.event == event))
            .collect()
    }

    /// Latest visible entry for `(check_id, scope)`, falling back to the root
    /// scope when no scoped entry exists.
    ///
    /// The fallback is what lets `outputs[name]` mean "name's result as
    /// visible from here" for both reducers and per-item mappers.
    /// Scan complexity: O(n).
    pub fn get(&self, check_id: &str, scope: &Scope, snapshot: Snapshot) -> Option<&JournalEntry> {
        let scoped = self
            .visible(snapshot)
            .iter()
            .rev()
            .find(|entry| entry.check_id == check_id && &entry.scope == scope);
        if scoped.is_some() || scope.is_root() {
            return scoped;
        }
        self.visible(snapshot)
            .iter()
            .rev()
            .find(|entry| entry.check_id == check_id && entry.scope.is_root())
    }

    /// All visible entries for `check_id` at any scope, in commit order.
    /// Scan complexity: O(n).
    pub fn get_history(&self, check_id: &str, snapshot: Snapshot) -> Vec<&JournalEntry> {
        self.visible(snapshot)
            .iter()
            .filter(|entry| entry.check_id == check_id)
            .collect()
    }

    /// Latest root-scope result per check, for the global outputs namespace.
    /// Scan complexity: O(n); later entries overwrite earlier ones.
    pub fn latest_root_results(&self, snapshot: Snapshot) -> BTreeMap<String, &CheckResult> {
        let mut results = BTreeMap::new();
        for entry in self.visible(snapshot) {
            if entry.scope.is_root() {
                results.insert(entry.check_id.clone(), &entry.result);
            }
        }
        results
    }
}
