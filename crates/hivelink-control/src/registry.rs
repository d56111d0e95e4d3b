//! Concurrent registry of live minion sessions.
//!
//! A fixed array of independently locked shards, the shard picked by an
//! FNV-1 hash of the session key. There is no lock spanning shards, so
//! cross-shard operations carry no ordering guarantee; `insert` on a single
//! key is the serialization point that decides which of two racing joins for
//! the same id wins.

use crate::record::ConnectionRecord;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Fixed for the process lifetime; only even distribution matters.
const SHARD_COUNT: usize = 8;

#[derive(Default)]
struct Shard {
    entries: RwLock<HashMap<String, Arc<ConnectionRecord>>>,
}

/// Sharded map from session key to live connection record.
pub struct SessionRegistry {
    shards: Vec<Shard>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Shard::default()).collect();
        Self { shards }
    }

    pub fn get(&self, key: &str) -> Option<Arc<ConnectionRecord>> {
        let entries = self.shard(key).entries.read().unwrap();
        entries.get(key).cloned()
    }

    /// Test-and-set insert: false iff the key is already present, in which
    /// case the caller must treat the session as already online and abort
    /// its registration.
    pub fn insert(&self, key: String, record: Arc<ConnectionRecord>) -> bool {
        let mut entries = self.shard(&key).entries.write().unwrap();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, record);
        true
    }

    /// Remove the key, reporting whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = self.shard(key).entries.write().unwrap();
        entries.remove(key).is_some()
    }

    /// Visit a point-in-time copy of every shard. Each shard is copied
    /// before the callback runs, so the callback may re-enter the registry
    /// without deadlocking; entries inserted or removed mid-iteration may or
    /// may not be seen.
    pub fn snapshot<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &Arc<ConnectionRecord>),
    {
        for shard in &self.shards {
            let copy: Vec<_> = {
                let entries = shard.entries.read().unwrap();
                entries
                    .iter()
                    .map(|(key, record)| (key.clone(), record.clone()))
                    .collect()
            };
            for (key, record) in &copy {
                visit(key, record);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.entries.read().unwrap().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, key: &str) -> &Shard {
        let idx = fnv1_32(key) as usize % SHARD_COUNT;
        &self.shards[idx]
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// FNV-1 (multiply then xor), 32-bit.
fn fnv1_32(key: &str) -> u32 {
    const OFFSET_BASIS: u32 = 2_166_136_261;
    const PRIME: u32 = 16_777_619;

    let mut hash = OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash = hash.wrapping_mul(PRIME);
        hash ^= u32::from(*byte);
    }
    hash
}
