//! Pending mutation records and their status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use offsync_common::{EntityKey, Error, RecordId, Result};

/// Kind of mutation carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Status of a single queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// Waiting for a sync pass.
    Pending,
    /// Submitted to the remote executor, outcome not yet known.
    InProgress,
    /// Applied remotely.
    Completed,
    /// Gave up; needs operator intervention.
    Failed,
    /// Diverged from remote; details are in the conflict store. The record
    /// keeps its place in the queue until the conflict is resolved.
    Conflict,
}

impl RecordStatus {
    /// Whether a record may move from `self` to `next`.
    pub fn can_transition_to(self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Conflict)
                | (InProgress, Pending)
                | (Failed, Pending)
                | (Conflict, Pending)
        )
    }

    /// Whether the record still holds its entity's place in line.
    pub fn is_unfinished(self) -> bool {
        !matches!(self, RecordStatus::Completed)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::InProgress => "IN_PROGRESS",
            RecordStatus::Completed => "COMPLETED",
            RecordStatus::Failed => "FAILED",
            RecordStatus::Conflict => "CONFLICT",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "PENDING" => Ok(RecordStatus::Pending),
            "IN_PROGRESS" => Ok(RecordStatus::InProgress),
            "COMPLETED" => Ok(RecordStatus::Completed),
            "FAILED" => Ok(RecordStatus::Failed),
            "CONFLICT" => Ok(RecordStatus::Conflict),
            other => Err(Error::InvalidInput(format!("Unknown record status: {}", other))),
        }
    }
}

/// A pending local mutation awaiting transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Stable identifier, assigned at enqueue time.
    pub id: RecordId,
    /// Position in the queue; lower values were enqueued earlier.
    pub seq: u64,
    /// Remote resource targeted by this mutation.
    pub entity: EntityKey,
    pub operation: Operation,
    /// Opaque serialized mutation data.
    pub payload: Vec<u8>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    pub status: RecordStatus,
    /// Number of retryable failures so far.
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Overwrite the remote regardless of its current state.
    #[serde(default)]
    pub forced: bool,
    /// Persistence version, bumped on every change.
    pub version: u64,
}

impl SyncRecord {
    /// Create a new pending record.
    pub fn new(seq: u64, entity: EntityKey, operation: Operation, payload: Vec<u8>) -> Self {
        Self {
            id: RecordId::new(),
            seq,
            entity,
            operation,
            payload,
            timestamp: Utc::now(),
            status: RecordStatus::Pending,
            retry_count: 0,
            last_error: None,
            forced: false,
            version: 0,
        }
    }

    /// Move to `next`, failing without side effects if the move is illegal.
    pub fn transition(&mut self, next: RecordStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.version += 1;
        Ok(())
    }

    /// Serialize for the append log.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from the append log.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SyncRecord {
        SyncRecord::new(
            0,
            EntityKey::new("note", "1").unwrap(),
            Operation::Create,
            b"{}".to_vec(),
        )
    }

    #[test]
    fn test_new_record_is_pending() {
        let r = record();
        assert_eq!(r.status, RecordStatus::Pending);
        assert_eq!(r.retry_count, 0);
        assert!(!r.forced);
    }

    #[test]
    fn test_valid_lifecycle() {
        let mut r = record();
        r.transition(RecordStatus::InProgress).unwrap();
        r.transition(RecordStatus::Completed).unwrap();
        assert_eq!(r.status, RecordStatus::Completed);
        assert_eq!(r.version, 2);
    }

    #[test]
    fn test_invalid_transition_has_no_effect() {
        let mut r = record();
        let err = r.transition(RecordStatus::Completed).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(r.status, RecordStatus::Pending);
        assert_eq!(r.version, 0);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut r = record();
        r.transition(RecordStatus::InProgress).unwrap();
        r.transition(RecordStatus::Completed).unwrap();
        assert!(r.transition(RecordStatus::InProgress).is_err());
        assert!(r.transition(RecordStatus::Pending).is_err());
    }

    #[test]
    fn test_conflict_returns_to_pending() {
        let mut r = record();
        r.transition(RecordStatus::InProgress).unwrap();
        r.transition(RecordStatus::Conflict).unwrap();
        assert!(r.status.is_unfinished());
        assert!(r.transition(RecordStatus::InProgress).is_err());
        r.transition(RecordStatus::Pending).unwrap();
        assert_eq!(r.version, 3);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("in-progress".parse::<RecordStatus>().unwrap(), RecordStatus::InProgress);
        assert_eq!("FAILED".parse::<RecordStatus>().unwrap(), RecordStatus::Failed);
        assert!("bogus".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn test_record_serialization() {
        let r = record();
        let restored = SyncRecord::from_bytes(&r.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, r);
    }
}
