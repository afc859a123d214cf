use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

/// Process-wide keyed store with namespace isolation, backing the `memory`
/// member of routing expression contexts.
///
/// All engine access happens inside routing, which is serialized by the
/// runner; the mutex exists so independent runs sharing a store stay safe.
/// Handles are cheap to clone and share the same underlying map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, HashMap<String, Value>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.get(namespace).and_then(|ns| ns.get(key)).cloned()
    }

    pub fn set(&self, namespace: &str, key: impl Into<String>, value: Value) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner
            .entry(namespace.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    pub fn has(&self, namespace: &str, key: &str) -> bool {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.get(namespace).is_some_and(|ns| ns.contains_key(key))
    }

    pub fn get_all(&self, namespace: &str) -> HashMap<String, Value> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.get(namespace).cloned().unwrap_or_default()
    }

    /// Add `by` to the numeric value under `key`, treating missing or
    /// non-numeric values as 0. Returns the new value.
    pub fn increment(&self, namespace: &str, key: &str, by: i64) -> i64 {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let ns = inner.entry(namespace.to_string()).or_default();
        let current = ns.get(key).and_then(Value::as_i64).unwrap_or(0);
        let next = current.saturating_add(by);
        ns.insert(key.to_string(), Value::from(next));
        next
    }

    pub fn clear(&self, namespace: &str) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.remove(namespace);
    }

    /// Snapshot of every namespace as a JSON object, handed to expression
    /// evaluation contexts.
    pub fn snapshot(&self) -> Value {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut namespaces = Map::new();
        for (namespace, entries) in inner.iter() {
            let mut object = Map::new();
            for (key, value) in entries {
                object.insert(key.clone(), value.clone());
            }
            namespaces.insert(namespace.clone(), Value::Object(object));
        }
        Value::Object(namespaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn namespaces_are_isolated() {
        let store = MemoryStore::new();
        store.set("run-a", "count", json!(1));
        store.set("run-b", "count", json!(9));

        assert_eq!(store.get("run-a", "count"), Some(json!(1)));
        assert_eq!(store.get("run-b", "count"), Some(json!(9)));
        store.clear("run-a");
        assert!(!store.has("run-a", "count"));
        assert!(store.has("run-b", "count"));
    }

    #[test]
    fn increment_treats_missing_as_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("ns", "hits", 2), 2);
        assert_eq!(store.increment("ns", "hits", 3), 5);

        store.set("ns", "label", json!("not a number"));
        assert_eq!(store.increment("ns", "label", 1), 1);
    }

    #[test]
    fn clones_share_state() {
        let store = MemoryStore::new();
        let handle = store.clone();
        handle.set("ns", "k", json!(true));
        assert_eq!(store.get("ns", "k"), Some(json!(true)));
    }

    #[test]
    fn snapshot_renders_namespaced_object() {
        let store = MemoryStore::new();
        store.set("ns", "k", json!([1, 2]));
        assert_eq!(store.snapshot(), json!({"ns": {"k": [1, 2]}}));
    }
}
