//! Capabilities the sync core consumes from the network layer.

use async_trait::async_trait;
use tokio::time::Instant;

use offsync_common::{EntityKey, Result};

use crate::record::{Operation, SyncRecord};

/// A mutation as handed to the remote executor.
#[derive(Debug, Clone, Copy)]
pub struct MutationRequest<'a> {
    pub operation: Operation,
    pub entity: &'a EntityKey,
    pub payload: &'a [u8],
    /// Overwrite remote state even if it diverged from the local base.
    pub force: bool,
}

impl<'a> From<&'a SyncRecord> for MutationRequest<'a> {
    fn from(record: &'a SyncRecord) -> Self {
        Self {
            operation: record.operation,
            entity: &record.entity,
            payload: &record.payload,
            force: record.forced,
        }
    }
}

/// Outcome reported by the remote executor for one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The remote applied the mutation; carries its resulting state if any.
    Applied(Option<Vec<u8>>),
    /// The remote state diverged from the record's assumed base.
    Conflict(Vec<u8>),
    /// Transient failure (network, 5xx, timeout).
    Retryable(String),
    /// Permanent rejection (malformed payload, 4xx).
    Fatal(String),
}

/// Transmits mutations to the remote service.
///
/// Implementations own transport, authentication and wire format. They
/// should give up by `deadline`; the engine also enforces it and treats an
/// overrun as a retryable failure.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, request: MutationRequest<'_>, deadline: Instant) -> ExecutionOutcome;
}

/// Fetches entity state from the remote service on cache misses.
#[async_trait]
pub trait RemoteReader<V>: Send + Sync {
    async fn fetch(&self, key: &str, deadline: Instant) -> Result<V>;
}
