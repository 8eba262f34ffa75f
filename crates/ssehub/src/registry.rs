//! Concurrent identifier -> connection map.

use std::sync::Arc;

use dashmap::DashMap;

use crate::client::UserClient;

/// Registry of live connections, keyed by client identifier.
pub type ClientRegistry = Registry<Arc<UserClient>>;

/// Concurrency-safe map from identifier to value.
///
/// Reads may happen from any task. In the broker, writes only come from the
/// hub's control loop.
///
/// `range` holds shard read locks while iterating; the callback must not write
/// back into the same registry.
#[derive(Debug)]
pub struct Registry<T> {
    entries: DashMap<String, T>,
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert a value, returning the one it replaced.
    pub fn set(&self, key: impl Into<String>, value: T) -> Option<T> {
        self.entries.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn delete(&self, key: &str) -> Option<T> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// Remove the entry only if `predicate` holds for its current value.
    pub fn delete_if(&self, key: &str, predicate: impl FnOnce(&T) -> bool) -> Option<T> {
        self.entries
            .remove_if(key, |_, value| predicate(value))
            .map(|(_, value)| value)
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Visit entries until `f` returns `false`.
    pub fn range(&self, mut f: impl FnMut(&str, &T) -> bool) {
        for entry in self.entries.iter() {
            if !f(entry.key(), entry.value()) {
                break;
            }
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn values(&self) -> Vec<T> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
