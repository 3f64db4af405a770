//! In-memory key-value storage owned by the replication engine.
//!
//! Alongside each entry the store keeps the last version applied for the
//! key (the "dependency" record). `put` writes both, so after every apply
//! the two agree.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::{error::ReplicaError, version::Version};

/// A stored value and the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub value: String,
    pub version: Version,
}

#[derive(Debug, Default)]
pub struct Store {
    entries: HashMap<String, Entry>,
    dependencies: HashMap<String, Version>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the entry and dependency record for `key`.
    pub fn put(&mut self, key: String, value: String, version: Version) {
        self.dependencies.insert(key.clone(), version);
        self.entries.insert(key, Entry { value, version });
    }

    pub fn get(&self, key: &str) -> Result<&Entry, ReplicaError> {
        self.entries.get(key).ok_or_else(|| ReplicaError::KeyNotFound {
            key: key.to_string(),
        })
    }

    /// Version last applied for `key`, if it was ever written.
    pub fn last_version(&self, key: &str) -> Option<Version> {
        self.dependencies.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted copy of every entry.
    pub fn snapshot(&self) -> BTreeMap<String, Entry> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_overwrites_entry_and_dependency() {
        let mut store = Store::new();
        store.put("x".into(), "lost".into(), Version::new(10, 1));
        store.put("x".into(), "found".into(), Version::new(12, 2));

        let entry = store.get("x").expect("x is stored");
        assert_eq!(entry.value, "found");
        assert_eq!(entry.version, Version::new(12, 2));
        assert_eq!(store.last_version("x"), Some(entry.version));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_key_reports_not_found() {
        let store = Store::new();
        match store.get("z") {
            Err(ReplicaError::KeyNotFound { key }) => assert_eq!(key, "z"),
            other => panic!("expected KeyNotFound, got {other:?}"),
        }
        assert_eq!(store.last_version("z"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn snapshot_is_sorted_by_key() {
        let mut store = Store::new();
        store.put("b".into(), "2".into(), Version::new(1, 1));
        store.put("a".into(), "1".into(), Version::new(1, 1));

        let keys: Vec<_> = store.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
