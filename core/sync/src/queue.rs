//! Durable, ordered offline queue of pending mutations.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use offsync_common::{EntityKey, Error, RecordId, Result};
use offsync_storage::{fold_entries, LogEntry, LogStore};

use crate::record::{Operation, RecordStatus, SyncRecord};

/// Log namespace holding queue records.
pub const QUEUE_NAMESPACE: &str = "queue";

#[derive(Default)]
struct QueueState {
    /// Records by queue position.
    records: BTreeMap<u64, SyncRecord>,
    index: HashMap<RecordId, u64>,
    /// Positions still holding their entity's place in line.
    by_entity: HashMap<EntityKey, BTreeSet<u64>>,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, record: SyncRecord) {
        let seq = record.seq;
        self.next_seq = self.next_seq.max(seq + 1);
        self.index.insert(record.id, seq);
        self.records.insert(seq, record);
        self.refresh_entity(seq);
    }

    fn take(&mut self, seq: u64) -> Option<SyncRecord> {
        let record = self.records.remove(&seq)?;
        self.index.remove(&record.id);
        self.detach_entity(&record.entity, seq);
        Some(record)
    }

    fn refresh_entity(&mut self, seq: u64) {
        let Some(record) = self.records.get(&seq) else {
            return;
        };
        if record.status.is_unfinished() {
            self.by_entity
                .entry(record.entity.clone())
                .or_default()
                .insert(seq);
        } else {
            let entity = record.entity.clone();
            self.detach_entity(&entity, seq);
        }
    }

    fn detach_entity(&mut self, entity: &EntityKey, seq: u64) {
        if let Some(set) = self.by_entity.get_mut(entity) {
            set.remove(&seq);
            if set.is_empty() {
                self.by_entity.remove(entity);
            }
        }
    }

    fn seq_of(&self, id: &RecordId) -> Result<u64> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("Record not found: {}", id)))
    }

    /// The earliest unfinished record for `entity`.
    fn entity_head(&self, entity: &EntityKey) -> Option<u64> {
        self.by_entity
            .get(entity)
            .and_then(|set| set.iter().next().copied())
    }
}

/// Durable FIFO of pending mutations.
///
/// In-memory state sits behind a mutex held only for map updates; records
/// are serialized and appended to the log after the lock is released. Every
/// append carries the record's version, so replay is order-independent.
pub struct OfflineQueue {
    log: Arc<dyn LogStore>,
    state: Mutex<QueueState>,
    /// Appends hold this shared; compaction holds it exclusively so a
    /// snapshot never misses an append that is still being written.
    persist_gate: RwLock<()>,
}

impl OfflineQueue {
    /// Open a queue backed by `log`, replaying any persisted records.
    ///
    /// Records left `IN_PROGRESS` by a previous process have an unknown
    /// outcome and are returned to `PENDING`. `COMPLETED` records whose
    /// removal never reached the log are dropped.
    ///
    /// # Errors
    /// - Log read failures
    /// - Undecodable records
    pub async fn open(log: Arc<dyn LogStore>) -> Result<Self> {
        let entries = fold_entries(log.replay(QUEUE_NAMESPACE).await?);
        let mut state = QueueState::default();
        let mut recovered = Vec::new();
        let mut finished = Vec::new();

        for entry in entries {
            let Some(bytes) = entry.value else {
                continue;
            };
            let mut record = SyncRecord::from_bytes(&bytes)?;
            match record.status {
                RecordStatus::InProgress => {
                    record.status = RecordStatus::Pending;
                    record.version += 1;
                    recovered.push(record.clone());
                }
                RecordStatus::Completed => {
                    state.next_seq = state.next_seq.max(record.seq + 1);
                    finished.push(record);
                    continue;
                }
                _ => {}
            }
            state.insert(record);
        }

        let queue = Self {
            log,
            state: Mutex::new(state),
            persist_gate: RwLock::new(()),
        };

        if !recovered.is_empty() {
            warn!(
                "Recovered {} interrupted records back to PENDING",
                recovered.len()
            );
            for record in &recovered {
                queue.persist(record).await?;
            }
        }
        for record in &finished {
            queue.persist_removal(record).await?;
        }

        info!("Opened offline queue with {} records", queue.len());
        Ok(queue)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self, record: &SyncRecord) -> Result<()> {
        let bytes = record.to_bytes()?;
        self.log
            .append(
                QUEUE_NAMESPACE,
                LogEntry::put(record.id.to_string(), record.version, bytes),
            )
            .await
    }

    async fn persist_removal(&self, record: &SyncRecord) -> Result<()> {
        self.log
            .append(
                QUEUE_NAMESPACE,
                LogEntry::delete(record.id.to_string(), record.version + 1),
            )
            .await
    }

    /// Append a new `PENDING` mutation to the tail of the queue.
    ///
    /// # Errors
    /// - Empty entity type or id
    /// - Log write failures
    pub async fn enqueue(
        &self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Vec<u8>,
    ) -> Result<SyncRecord> {
        let entity = EntityKey::new(entity_type, entity_id)?;
        self.push(entity, operation, payload, false).await
    }

    pub(crate) async fn push(
        &self,
        entity: EntityKey,
        operation: Operation,
        payload: Vec<u8>,
        forced: bool,
    ) -> Result<SyncRecord> {
        let _gate = self.persist_gate.read().await;
        let record = {
            let mut state = self.lock();
            let mut record = SyncRecord::new(state.next_seq, entity, operation, payload);
            record.forced = forced;
            state.insert(record.clone());
            record
        };
        if let Err(e) = self.persist(&record).await {
            self.lock().take(record.seq);
            return Err(e);
        }

        debug!(
            "Enqueued {} {} for {} (seq {})",
            record.id, record.operation, record.entity, record.seq
        );
        Ok(record)
    }

    /// Up to `n` pending records in queue order, without removing them.
    ///
    /// Records stuck behind an in-flight, failed or conflicted mutation of
    /// the same entity are skipped.
    pub fn dequeue_batch(&self, n: usize) -> Vec<SyncRecord> {
        let state = self.lock();
        let mut blocked: HashSet<&EntityKey> = HashSet::new();
        let mut batch = Vec::new();

        for record in state.records.values() {
            if batch.len() >= n {
                break;
            }
            match record.status {
                RecordStatus::InProgress | RecordStatus::Failed | RecordStatus::Conflict => {
                    blocked.insert(&record.entity);
                }
                RecordStatus::Pending if !blocked.contains(&record.entity) => {
                    batch.push(record.clone());
                }
                _ => {}
            }
        }

        batch
    }

    /// Apply `apply` to a copy of the record, commit it, then persist it.
    ///
    /// A failed append restores the previous state in memory.
    async fn change<F>(&self, id: &RecordId, apply: F) -> Result<SyncRecord>
    where
        F: FnOnce(&QueueState, &mut SyncRecord) -> Result<()>,
    {
        let _gate = self.persist_gate.read().await;
        let (previous, updated) = {
            let mut state = self.lock();
            let seq = state.seq_of(id)?;
            let previous = state
                .records
                .get(&seq)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("Record not found: {}", id)))?;

            // Work on a copy so a rejected change leaves the queue untouched.
            let mut updated = previous.clone();
            apply(&*state, &mut updated)?;

            state.records.insert(seq, updated.clone());
            state.refresh_entity(seq);
            (previous, updated)
        };

        if let Err(e) = self.persist(&updated).await {
            warn!("Failed to persist {}, keeping {}: {}", updated.id, previous.status, e);
            self.roll_back(previous, &updated);
            return Err(e);
        }
        Ok(updated)
    }

    fn roll_back(&self, mut previous: SyncRecord, failed: &SyncRecord) {
        // The append may have landed; never reuse its version.
        previous.version = failed.version;
        let seq = previous.seq;
        let mut state = self.lock();
        if state.records.get(&seq).map(|r| r.version) == Some(failed.version) {
            state.records.insert(seq, previous);
            state.refresh_entity(seq);
        }
    }

    /// Remove a record after `check` accepts it, restoring it if the
    /// tombstone cannot be written.
    async fn take_record<F>(&self, id: &RecordId, check: F) -> Result<SyncRecord>
    where
        F: FnOnce(&SyncRecord) -> Result<()>,
    {
        let _gate = self.persist_gate.read().await;
        let record = {
            let mut state = self.lock();
            let seq = state.seq_of(id)?;
            if let Some(record) = state.records.get(&seq) {
                check(record)?;
            }
            state
                .take(seq)
                .ok_or_else(|| Error::NotFound(format!("Record not found: {}", id)))?
        };

        if let Err(e) = self.persist_removal(&record).await {
            self.lock().insert(record);
            return Err(e);
        }
        Ok(record)
    }

    /// `PENDING -> IN_PROGRESS`.
    ///
    /// # Errors
    /// - `InvalidStateTransition` if the record is not pending
    /// - `OutOfOrder` if an earlier mutation of the same entity is unfinished
    pub async fn mark_in_progress(&self, id: &RecordId) -> Result<SyncRecord> {
        self.change(id, |state, record| {
            if record.status == RecordStatus::Pending
                && state.entity_head(&record.entity) != Some(record.seq)
            {
                return Err(Error::OutOfOrder {
                    id: record.id.to_string(),
                    entity: record.entity.to_string(),
                });
            }
            record.transition(RecordStatus::InProgress)
        })
        .await
    }

    /// `IN_PROGRESS -> COMPLETED`.
    pub async fn mark_completed(&self, id: &RecordId) -> Result<SyncRecord> {
        self.change(id, |_, record| {
            record.transition(RecordStatus::Completed)?;
            record.last_error = None;
            Ok(())
        })
        .await
    }

    /// `IN_PROGRESS -> FAILED`, bypassing the retry budget.
    pub async fn mark_failed(&self, id: &RecordId, error: impl Into<String>) -> Result<SyncRecord> {
        let error = error.into();
        self.change(id, |_, record| {
            record.transition(RecordStatus::Failed)?;
            record.last_error = Some(error);
            Ok(())
        })
        .await
    }

    /// Record a retryable failure.
    ///
    /// Moves the record back to `PENDING`, or to `FAILED` once its retry
    /// count reaches `max_attempts`.
    pub async fn mark_retryable(
        &self,
        id: &RecordId,
        error: impl Into<String>,
        max_attempts: u32,
    ) -> Result<SyncRecord> {
        let error = error.into();
        self.change(id, |_, record| {
            let attempts = record.retry_count + 1;
            let next = if attempts >= max_attempts {
                RecordStatus::Failed
            } else {
                RecordStatus::Pending
            };
            if record.status != RecordStatus::InProgress {
                return Err(Error::InvalidStateTransition {
                    id: record.id.to_string(),
                    from: record.status.to_string(),
                    to: next.to_string(),
                });
            }
            record.transition(next)?;
            record.retry_count = attempts;
            record.last_error = Some(error);
            Ok(())
        })
        .await
    }

    /// `IN_PROGRESS -> CONFLICT`.
    ///
    /// The record stops being dispatched but keeps its place, so later
    /// mutations of its entity wait until the conflict is resolved.
    pub async fn mark_conflict(&self, id: &RecordId) -> Result<SyncRecord> {
        self.change(id, |_, record| {
            record.transition(RecordStatus::Conflict)?;
            record.last_error = Some(
                Error::ConflictDetected(format!("remote state of {} diverged", record.entity))
                    .to_string(),
            );
            Ok(())
        })
        .await
    }

    /// Return an `IN_PROGRESS` record to `PENDING` after its outcome could
    /// not be recorded.
    ///
    /// The in-memory change stands even if the append fails: an
    /// `IN_PROGRESS` entry in the log replays as `PENDING` anyway.
    pub(crate) async fn release(&self, id: &RecordId) {
        let _gate = self.persist_gate.read().await;
        let record = {
            let mut state = self.lock();
            let Ok(seq) = state.seq_of(id) else {
                return;
            };
            let Some(record) = state.records.get_mut(&seq) else {
                return;
            };
            if record.status != RecordStatus::InProgress
                || record.transition(RecordStatus::Pending).is_err()
            {
                return;
            }
            let record = record.clone();
            state.refresh_entity(seq);
            record
        };

        warn!("Released {} back to PENDING", record.id);
        if let Err(e) = self.persist(&record).await {
            warn!("Could not persist release of {}: {}", record.id, e);
        }
    }

    /// Replace a conflicted record with its resolved mutation, in place.
    ///
    /// The record keeps its queue position, becomes `PENDING` and is marked
    /// `forced`. If the record is gone (discarded by an operator), the
    /// mutation is queued at the tail instead.
    pub(crate) async fn rewrite_conflicted(
        &self,
        id: &RecordId,
        entity: &EntityKey,
        operation: Operation,
        payload: Vec<u8>,
    ) -> Result<SyncRecord> {
        if self.get(id).is_none() {
            return self.push(entity.clone(), operation, payload, true).await;
        }

        self.change(id, |_, record| {
            match record.status {
                RecordStatus::Conflict => record.transition(RecordStatus::Pending)?,
                // Conflict stored but the park never reached the log.
                RecordStatus::Pending => record.version += 1,
                other => {
                    return Err(Error::InvalidStateTransition {
                        id: record.id.to_string(),
                        from: other.to_string(),
                        to: RecordStatus::Pending.to_string(),
                    })
                }
            }
            record.operation = operation;
            record.payload = payload;
            record.forced = true;
            record.retry_count = 0;
            record.last_error = None;
            Ok(())
        })
        .await
    }

    /// Drop a conflicted record whose local change lost to the server.
    pub(crate) async fn discard_conflicted(&self, id: &RecordId) -> Result<()> {
        let result = self
            .take_record(id, |record| match record.status {
                RecordStatus::Conflict | RecordStatus::Pending => Ok(()),
                other => Err(Error::InvalidStateTransition {
                    id: record.id.to_string(),
                    from: other.to_string(),
                    to: "REMOVED".to_string(),
                }),
            })
            .await;
        match result {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Operator intervention: `FAILED -> PENDING` with a fresh retry budget.
    pub async fn requeue(&self, id: &RecordId) -> Result<SyncRecord> {
        let record = self
            .change(id, |_, record| {
                if record.status != RecordStatus::Failed {
                    return Err(Error::InvalidStateTransition {
                        id: record.id.to_string(),
                        from: record.status.to_string(),
                        to: RecordStatus::Pending.to_string(),
                    });
                }
                record.transition(RecordStatus::Pending)?;
                record.retry_count = 0;
                record.last_error = None;
                Ok(())
            })
            .await?;
        info!("Requeued failed record {}", record.id);
        Ok(record)
    }

    /// Permanently delete a record.
    ///
    /// # Errors
    /// - `InvalidStateTransition` if the record is in flight, or waiting on
    ///   a conflict resolution
    pub async fn remove(&self, id: &RecordId) -> Result<SyncRecord> {
        self.take_record(id, |record| match record.status {
            RecordStatus::InProgress | RecordStatus::Conflict => {
                Err(Error::InvalidStateTransition {
                    id: record.id.to_string(),
                    from: record.status.to_string(),
                    to: "REMOVED".to_string(),
                })
            }
            _ => Ok(()),
        })
        .await
    }

    /// Look up a record by id.
    pub fn get(&self, id: &RecordId) -> Option<SyncRecord> {
        let state = self.lock();
        let seq = state.index.get(id)?;
        state.records.get(seq).cloned()
    }

    /// Records in queue order, optionally filtered by status.
    pub fn list(&self, status: Option<RecordStatus>) -> Vec<SyncRecord> {
        self.lock()
            .records
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Check whether the queue holds no records.
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Count records by status.
    pub fn counts(&self) -> HashMap<RecordStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.lock().records.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    /// Rewrite the log so it holds exactly one entry per live record.
    pub async fn compact(&self) -> Result<usize> {
        let _gate = self.persist_gate.write().await;
        let records: Vec<SyncRecord> = self.lock().records.values().cloned().collect();

        let mut entries = Vec::with_capacity(records.len());
        for record in &records {
            entries.push(LogEntry::put(
                record.id.to_string(),
                record.version,
                record.to_bytes()?,
            ));
        }

        let count = entries.len();
        self.log.compact(QUEUE_NAMESPACE, entries).await?;
        info!("Compacted offline queue log to {} records", count);
        Ok(count)
    }
}
