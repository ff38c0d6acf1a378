//! Append-log trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use offsync_common::Result;

/// One entry of an append log.
///
/// `value == None` marks a tombstone for `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Key the entry applies to.
    pub key: String,
    /// Monotonic per-key version assigned by the owner of the key.
    pub version: u64,
    /// Serialized value, or `None` for a delete.
    pub value: Option<Vec<u8>>,
}

impl LogEntry {
    /// Create a put entry.
    pub fn put(key: impl Into<String>, version: u64, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            version,
            value: Some(value),
        }
    }

    /// Create a tombstone entry.
    pub fn delete(key: impl Into<String>, version: u64) -> Self {
        Self {
            key: key.into(),
            version,
            value: None,
        }
    }

    /// Check whether this entry is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Durable, ordered key/value append log.
///
/// Owners (queue, conflict store) append one entry per mutation. Entries are
/// never rewritten in place; `compact` replaces a whole namespace at once.
/// Implementations must make `append` durable before returning.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Append an entry to a namespace.
    ///
    /// # Postconditions
    /// - The entry survives process restart (for durable backends)
    ///
    /// # Errors
    /// - I/O or serialization failures
    async fn append(&self, namespace: &str, entry: LogEntry) -> Result<()>;

    /// Read every entry of a namespace in append order.
    ///
    /// An unknown namespace replays as empty.
    async fn replay(&self, namespace: &str) -> Result<Vec<LogEntry>>;

    /// Atomically replace a namespace with the given entries.
    async fn compact(&self, namespace: &str, entries: Vec<LogEntry>) -> Result<()>;
}

/// Reduce a replayed log to the live value of every key.
///
/// The entry with the highest version wins regardless of its position in the
/// log; tombstoned keys are dropped. Output keeps first-append order of keys.
pub fn fold_entries(entries: Vec<LogEntry>) -> Vec<LogEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, LogEntry> = HashMap::new();

    for entry in entries {
        match latest.get(&entry.key) {
            Some(existing) if existing.version > entry.version => {}
            Some(_) => {
                latest.insert(entry.key.clone(), entry);
            }
            None => {
                order.push(entry.key.clone());
                latest.insert(entry.key.clone(), entry);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .filter(|entry| !entry.is_tombstone())
        .collect()
}
