//! Snapshot persistence.
//!
//! Snapshots are stored as JSON blobs in the host's key-value store under
//! `"dpos-" ∥ blockHash`. The store itself is abstracted so production
//! can back it with its database while tests run fully in memory.

use super::{DposError, Snapshot};
use alloy_primitives::B256;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Database key prefix for DPoS snapshots.
pub const DB_SNAP_PREFIX: &[u8] = b"dpos-";

/// Raw key-value access provided by the host.
pub trait KeyValueStore: Send + Sync {
    /// Load the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DposError>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), DposError>;
}

impl<K: KeyValueStore + ?Sized> KeyValueStore for &K {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DposError> {
        (**self).get(key)
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), DposError> {
        (**self).put(key, value)
    }
}

impl<K: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<K> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DposError> {
        (**self).get(key)
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), DposError> {
        (**self).put(key, value)
    }
}

/// Typed snapshot storage.
pub trait SnapshotStore: Send + Sync {
    /// Load a snapshot by block hash.
    fn load_snapshot(&self, hash: B256) -> Result<Option<Snapshot>, DposError>;

    /// Store a snapshot under its block hash.
    fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), DposError>;
}

/// Snapshot storage on top of a raw key-value store.
#[derive(Debug)]
pub struct KvSnapshotStore<K: KeyValueStore> {
    kv: K,
}

impl<K: KeyValueStore> KvSnapshotStore<K> {
    /// Wrap a key-value store.
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    fn key(hash: B256) -> Vec<u8> {
        let mut key = Vec::with_capacity(DB_SNAP_PREFIX.len() + 32);
        key.extend_from_slice(DB_SNAP_PREFIX);
        key.extend_from_slice(hash.as_slice());
        key
    }
}

impl<K: KeyValueStore> SnapshotStore for KvSnapshotStore<K> {
    fn load_snapshot(&self, hash: B256) -> Result<Option<Snapshot>, DposError> {
        let Some(blob) = self.kv.get(&Self::key(hash))? else {
            return Ok(None);
        };
        let snapshot = serde_json::from_slice(&blob).map_err(|err| DposError::DatabaseError {
            message: err.to_string(),
        })?;
        Ok(Some(snapshot))
    }

    fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), DposError> {
        let blob = serde_json::to_vec(snapshot).map_err(|err| DposError::DatabaseError {
            message: err.to_string(),
        })?;
        self.kv.put(&Self::key(snapshot.hash), blob)
    }
}

/// Memory-backed key-value store for testing.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DposError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), DposError> {
        self.entries.write().insert(key.to_vec(), value);
        Ok(())
    }
}
