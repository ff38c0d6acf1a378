//! In-memory append log for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::log::{LogEntry, LogStore};
use offsync_common::Result;

/// In-memory append log.
///
/// Useful for testing and ephemeral sessions. All entries are kept in
/// memory and lost on drop. Clones share the same underlying log, which
/// lets tests "restart" a queue against the same data.
#[derive(Clone, Default)]
pub struct MemoryLog {
    namespaces: Arc<RwLock<HashMap<String, Vec<LogEntry>>>>,
}

impl MemoryLog {
    /// Create a new empty memory log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of raw entries appended to a namespace.
    pub fn entry_count(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl LogStore for MemoryLog {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, namespace: &str, entry: LogEntry) -> Result<()> {
        self.namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace.to_string())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn replay(&self, namespace: &str) -> Result<Vec<LogEntry>> {
        Ok(self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn compact(&self, namespace: &str, entries: Vec<LogEntry>) -> Result<()> {
        self.namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.to_string(), entries);
        Ok(())
    }
}
