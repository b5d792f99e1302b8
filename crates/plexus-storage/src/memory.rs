//! In-process key/value backend
//!
//! Sharded concurrent maps provide the per-key atomicity the
//! [`KeyValueStore`] contract requires. Used by tests and embedded
//! deployments; a clustered deployment swaps in a remote backend behind
//! the same trait.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use plexus_core::Result;
use std::sync::Arc;

use crate::KeyValueStore;

type Keyspace = Arc<DashMap<String, Vec<u8>>>;

/// In-process implementation of [`KeyValueStore`] over sharded maps
#[derive(Default)]
pub struct MemoryStore {
    keyspaces: DashMap<String, Keyspace>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn keyspace(&self, name: &str) -> Keyspace {
        if let Some(ks) = self.keyspaces.get(name) {
            return Arc::clone(ks.value());
        }
        Arc::clone(
            self.keyspaces
                .entry(name.to_string())
                .or_default()
                .value(),
        )
    }

    /// Number of entries in one keyspace (test/diagnostic helper)
    pub fn len(&self, keyspace: &str) -> usize {
        self.keyspace(keyspace).len()
    }

    /// True when the keyspace holds no entries
    pub fn is_empty(&self, keyspace: &str) -> bool {
        self.len(keyspace) == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keyspace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.keyspace(keyspace).get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, keyspace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.keyspace(keyspace).insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(
        &self,
        keyspace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        let ks = self.keyspace(keyspace);
        let result = match ks.entry(key.to_string()) {
            Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(None)
            }
        };
        result
    }

    async fn compare_and_swap(
        &self,
        keyspace: &str,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool> {
        let ks = self.keyspace(keyspace);
        // The entry guard holds the shard lock, making the compare and the
        // swap one atomic step for this key.
        let result = match (ks.entry(key.to_string()), expected) {
            (Entry::Occupied(mut slot), Some(expected)) => {
                if slot.get().as_slice() == expected {
                    slot.insert(value);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            (Entry::Occupied(_), None) => Ok(false),
            (Entry::Vacant(_), Some(_)) => Ok(false),
            (Entry::Vacant(slot), None) => {
                slot.insert(value);
                Ok(true)
            }
        };
        result
    }

    async fn remove(&self, keyspace: &str, key: &str) -> Result<bool> {
        Ok(self.keyspace(keyspace).remove(key).is_some())
    }

    async fn scan_prefix(&self, keyspace: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .keyspace(keyspace)
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }
}
