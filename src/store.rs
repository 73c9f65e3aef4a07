use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// This node's local shard. The engine only ever touches storage through
/// this interface; durability is the implementation's concern.
///
/// The empty string is reserved to mean "absent", so a value stored here is
/// never empty.
pub trait LocalStore {
    /// Insert if absent. Returns false when the key already exists, leaving
    /// the stored value untouched.
    fn create(&mut self, key: &str, value: &str) -> bool;

    fn read(&self, key: &str) -> Option<String>;

    /// Overwrite an existing key. Returns false when the key is absent.
    fn update(&mut self, key: &str, value: &str) -> bool;

    fn delete(&mut self, key: &str) -> bool;

    fn is_empty(&self) -> bool;

    /// Snapshot of every entry, for re-replication after a ring change.
    fn entries(&self) -> Vec<(String, String)>;
}

/// In-memory shard backing a node.
#[derive(Debug, Default)]
pub struct MemStore {
    map: HashMap<String, String>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

impl LocalStore for MemStore {
    fn create(&mut self, key: &str, value: &str) -> bool {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                true
            }
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    fn update(&mut self, key: &str, value: &str) -> bool {
        match self.map.get_mut(key) {
            Some(slot) => {
                *slot = value.to_string();
                true
            }
            None => false,
        }
    }

    fn delete(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn entries(&self) -> Vec<(String, String)> {
        self.map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_insert_if_absent() {
        let mut store = MemStore::new();
        assert!(store.create("mars", "red"));
        // a second create reports failure and does not clobber
        assert!(!store.create("mars", "blue"));
        assert_eq!(store.read("mars").as_deref(), Some("red"));
    }

    #[test]
    fn update_requires_presence() {
        let mut store = MemStore::new();
        assert!(!store.update("venus", "hot"));
        assert!(store.create("venus", "warm"));
        assert!(store.update("venus", "hot"));
        assert_eq!(store.read("venus").as_deref(), Some("hot"));
    }

    #[test]
    fn delete_removes_exactly_once() {
        let mut store = MemStore::new();
        assert!(store.create("pluto", "small"));
        assert!(store.delete("pluto"));
        assert!(!store.delete("pluto"));
        assert!(store.read("pluto").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn entries_snapshot_everything() {
        let mut store = MemStore::new();
        store.create("a", "1");
        store.create("b", "2");

        let mut entries = store.entries();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
    }
}
