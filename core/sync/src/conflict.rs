//! Conflict storage and resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use offsync_common::{ConflictId, EntityKey, Error, RecordId, Result};
use offsync_storage::{fold_entries, LogEntry, LogStore};

use crate::cache::CacheStore;
use crate::events::{EventBus, SyncEvent};
use crate::queue::OfflineQueue;
use crate::record::{Operation, SyncRecord};

/// Log namespace holding unresolved conflicts.
pub const CONFLICT_NAMESPACE: &str = "conflicts";

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictResolution {
    /// Discard the local payload; remote state is the truth.
    ServerWins,
    /// Re-send the local payload, overwriting remote state.
    ClientWins,
    /// Leave the conflict until a caller supplies a merged payload.
    ManualResolution,
    /// Combine both payloads with the configured merger.
    Merge,
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictResolution::ServerWins => "server-wins",
            ConflictResolution::ClientWins => "client-wins",
            ConflictResolution::ManualResolution => "manual",
            ConflictResolution::Merge => "merge",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ConflictResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "server-wins" => Ok(ConflictResolution::ServerWins),
            "client-wins" => Ok(ConflictResolution::ClientWins),
            "manual" | "manual-resolution" => Ok(ConflictResolution::ManualResolution),
            "merge" => Ok(ConflictResolution::Merge),
            other => Err(Error::InvalidInput(format!(
                "Unknown conflict strategy: {}",
                other
            ))),
        }
    }
}

/// A detected mismatch between a local mutation and remote state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,
    /// The queued mutation that hit the conflict.
    pub record_id: RecordId,
    pub entity: EntityKey,
    pub operation: Operation,
    pub local_data: Vec<u8>,
    pub server_data: Vec<u8>,
    /// When the conflict was detected.
    pub timestamp: DateTime<Utc>,
    pub resolution: Option<ConflictResolution>,
    pub version: u64,
}

impl SyncConflict {
    /// Build a conflict from the record that hit it and the remote state.
    pub fn from_record(record: &SyncRecord, server_data: Vec<u8>) -> Self {
        Self {
            id: ConflictId::new(),
            record_id: record.id,
            entity: record.entity.clone(),
            operation: record.operation,
            local_data: record.payload.clone(),
            server_data,
            timestamp: Utc::now(),
            resolution: None,
            version: 0,
        }
    }
}

/// Persisted set of unresolved conflicts, in detection order.
pub struct ConflictStore {
    log: Arc<dyn LogStore>,
    conflicts: Mutex<Vec<SyncConflict>>,
    /// Conflicts a resolver is currently working on.
    claimed: Mutex<HashSet<ConflictId>>,
}

impl ConflictStore {
    /// Open a store backed by `log`, replaying persisted conflicts.
    pub async fn open(log: Arc<dyn LogStore>) -> Result<Self> {
        let mut conflicts = Vec::new();
        for entry in fold_entries(log.replay(CONFLICT_NAMESPACE).await?) {
            if let Some(bytes) = entry.value {
                conflicts.push(serde_json::from_slice::<SyncConflict>(&bytes)?);
            }
        }
        debug!("Opened conflict store with {} conflicts", conflicts.len());
        Ok(Self {
            log,
            conflicts: Mutex::new(conflicts),
            claimed: Mutex::new(HashSet::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SyncConflict>> {
        self.conflicts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claims(&self) -> MutexGuard<'_, HashSet<ConflictId>> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a conflict.
    ///
    /// A conflict for a record that already has one replaces it, so a
    /// resubmitted record never produces duplicates.
    pub async fn add(&self, conflict: SyncConflict) -> Result<SyncConflict> {
        let (stored, previous) = {
            let mut conflicts = self.lock();
            let mut conflict = conflict;
            match conflicts
                .iter_mut()
                .find(|c| c.record_id == conflict.record_id)
            {
                Some(existing) => {
                    conflict.id = existing.id;
                    conflict.version = existing.version + 1;
                    let previous = std::mem::replace(existing, conflict.clone());
                    (conflict, Some(previous))
                }
                None => {
                    conflicts.push(conflict.clone());
                    (conflict, None)
                }
            }
        };

        let bytes = serde_json::to_vec(&stored)?;
        let appended = self
            .log
            .append(
                CONFLICT_NAMESPACE,
                LogEntry::put(stored.id.to_string(), stored.version, bytes),
            )
            .await;
        if let Err(e) = appended {
            let mut conflicts = self.lock();
            if let Some(index) = conflicts
                .iter()
                .position(|c| c.id == stored.id && c.version == stored.version)
            {
                match previous {
                    Some(mut previous) => {
                        previous.version = stored.version;
                        conflicts[index] = previous;
                    }
                    None => {
                        conflicts.remove(index);
                    }
                }
            }
            return Err(e);
        }
        Ok(stored)
    }

    pub fn get(&self, id: &ConflictId) -> Option<SyncConflict> {
        self.lock().iter().find(|c| c.id == *id).cloned()
    }

    /// Mark a conflict as being resolved.
    ///
    /// # Errors
    /// - `NotFound` if no such conflict exists
    /// - `InvalidInput` if another resolution is already under way
    pub(crate) fn claim(&self, id: &ConflictId) -> Result<SyncConflict> {
        let conflict = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Conflict not found: {}", id)))?;
        if !self.claims().insert(*id) {
            return Err(Error::InvalidInput(format!(
                "Conflict {} is already being resolved",
                id
            )));
        }
        Ok(conflict)
    }

    pub(crate) fn unclaim(&self, id: &ConflictId) {
        self.claims().remove(id);
    }

    /// All unresolved conflicts in detection order.
    pub fn list(&self) -> Vec<SyncConflict> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Delete a conflict and return it.
    ///
    /// # Errors
    /// - `NotFound` if no such conflict exists (or another caller removed it)
    /// - Log write failures, in which case the conflict is kept
    pub async fn remove(&self, id: &ConflictId) -> Result<SyncConflict> {
        let (index, removed) = {
            let mut conflicts = self.lock();
            let index = conflicts
                .iter()
                .position(|c| c.id == *id)
                .ok_or_else(|| Error::NotFound(format!("Conflict not found: {}", id)))?;
            (index, conflicts.remove(index))
        };

        let appended = self
            .log
            .append(
                CONFLICT_NAMESPACE,
                LogEntry::delete(removed.id.to_string(), removed.version + 1),
            )
            .await;
        if let Err(e) = appended {
            let mut conflicts = self.lock();
            let index = index.min(conflicts.len());
            conflicts.insert(index, removed);
            return Err(e);
        }
        self.unclaim(id);
        Ok(removed)
    }
}

/// Result of a merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Merged(Vec<u8>),
    /// The merger cannot decide; a person has to.
    NeedsManual(String),
}

/// Field-level merge of local and server payloads.
///
/// Must be deterministic and total: always a merged value or an explicit
/// request for manual resolution.
pub trait Merger: Send + Sync {
    fn merge(&self, conflict: &SyncConflict) -> MergeResult;
}

impl<F> Merger for F
where
    F: Fn(&SyncConflict) -> MergeResult + Send + Sync,
{
    fn merge(&self, conflict: &SyncConflict) -> MergeResult {
        self(conflict)
    }
}

/// Merges JSON object payloads key by key.
///
/// Keys present on one side only are kept; keys present on both sides take
/// the local value. Anything that is not a pair of JSON objects needs manual
/// resolution, as does a conflicting delete.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFieldMerge;

impl Merger for JsonFieldMerge {
    fn merge(&self, conflict: &SyncConflict) -> MergeResult {
        if conflict.operation == Operation::Delete {
            return MergeResult::NeedsManual("cannot merge a delete".to_string());
        }

        let local = serde_json::from_slice::<serde_json::Value>(&conflict.local_data);
        let server = serde_json::from_slice::<serde_json::Value>(&conflict.server_data);

        match (local, server) {
            (Ok(serde_json::Value::Object(local)), Ok(serde_json::Value::Object(mut merged))) => {
                for (key, value) in local {
                    merged.insert(key, value);
                }
                match serde_json::to_vec(&serde_json::Value::Object(merged)) {
                    Ok(bytes) => MergeResult::Merged(bytes),
                    Err(e) => MergeResult::NeedsManual(e.to_string()),
                }
            }
            _ => MergeResult::NeedsManual("payloads are not both JSON objects".to_string()),
        }
    }
}

/// What resolving a conflict did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Remote state accepted as-is; the cache was refreshed if present.
    AcceptedRemote,
    /// The conflicted record was rewritten as a forced mutation carrying
    /// the resolution.
    Requeued(SyncRecord),
}

enum Action {
    AcceptRemote,
    Requeue(Operation, Vec<u8>),
}

/// Applies resolution strategies to stored conflicts.
///
/// The parked record is rewritten in place, so the write-back keeps its
/// entity's original position. Server-wins drops it.
pub struct ConflictResolver {
    store: Arc<ConflictStore>,
    queue: Arc<OfflineQueue>,
    cache: Option<(Arc<CacheStore<Vec<u8>>>, u64)>,
    merger: Arc<dyn Merger>,
    events: EventBus,
}

impl ConflictResolver {
    pub fn new(store: Arc<ConflictStore>, queue: Arc<OfflineQueue>, events: EventBus) -> Self {
        Self {
            store,
            queue,
            cache: None,
            merger: Arc::new(JsonFieldMerge),
            events,
        }
    }

    /// Refresh `cache` with server state when the server wins.
    pub fn with_cache(mut self, cache: Arc<CacheStore<Vec<u8>>>, ttl_secs: u64) -> Self {
        self.cache = Some((cache, ttl_secs));
        self
    }

    /// Replace the default JSON field merge.
    pub fn with_merger(mut self, merger: Arc<dyn Merger>) -> Self {
        self.merger = merger;
        self
    }

    pub fn store(&self) -> &Arc<ConflictStore> {
        &self.store
    }

    /// Resolve a conflict with an automatic strategy.
    ///
    /// # Errors
    /// - `NotFound` if the conflict doesn't exist
    /// - `ManualResolutionRequired` for `ManualResolution`, or when the
    ///   merger cannot decide; the conflict stays in the store
    pub async fn resolve(
        &self,
        id: &ConflictId,
        strategy: ConflictResolution,
    ) -> Result<ResolutionOutcome> {
        let conflict = self
            .store
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Conflict not found: {}", id)))?;

        let action = match strategy {
            ConflictResolution::ServerWins => Action::AcceptRemote,
            ConflictResolution::ClientWins => {
                Action::Requeue(conflict.operation, conflict.local_data.clone())
            }
            ConflictResolution::Merge => match self.merger.merge(&conflict) {
                MergeResult::Merged(payload) => Action::Requeue(Operation::Update, payload),
                MergeResult::NeedsManual(reason) => {
                    return Err(Error::ManualResolutionRequired(format!(
                        "Conflict {} on {}: {}",
                        id, conflict.entity, reason
                    )));
                }
            },
            ConflictResolution::ManualResolution => {
                return Err(Error::ManualResolutionRequired(format!(
                    "Conflict {} on {} needs a merged payload",
                    id, conflict.entity
                )));
            }
        };

        self.apply(id, strategy, action).await
    }

    /// Clear a conflict with a caller-supplied merged payload.
    pub async fn resolve_manually(
        &self,
        id: &ConflictId,
        merged: Vec<u8>,
    ) -> Result<ResolutionOutcome> {
        self.apply(
            id,
            ConflictResolution::ManualResolution,
            Action::Requeue(Operation::Update, merged),
        )
        .await
    }

    async fn apply(
        &self,
        id: &ConflictId,
        strategy: ConflictResolution,
        action: Action,
    ) -> Result<ResolutionOutcome> {
        // The conflict stays stored until the queue reflects the resolution.
        let mut conflict = self.store.claim(id)?;

        let outcome = match self.settle(&conflict, action).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Failed to apply resolution for {}: {}", id, e);
                self.store.unclaim(id);
                return Err(e);
            }
        };
        if let Err(e) = self.store.remove(id).await {
            // The queue already holds the resolution; the next attempt
            // rewrites the same record again.
            warn!("Failed to clear resolved conflict {}: {}", id, e);
            self.store.unclaim(id);
            return Err(e);
        }
        conflict.resolution = Some(strategy);

        info!(
            "Resolved conflict {} on {} with {}",
            conflict.id, conflict.entity, strategy
        );
        self.events.publish(SyncEvent::ConflictResolved {
            conflict_id: conflict.id,
            entity: conflict.entity,
            resolution: strategy,
        });
        Ok(outcome)
    }

    async fn settle(&self, conflict: &SyncConflict, action: Action) -> Result<ResolutionOutcome> {
        match action {
            Action::AcceptRemote => {
                self.queue.discard_conflicted(&conflict.record_id).await?;
                if let Some((cache, ttl_secs)) = &self.cache {
                    cache.put(
                        conflict.entity.cache_key(),
                        conflict.server_data.clone(),
                        *ttl_secs,
                    );
                }
                Ok(ResolutionOutcome::AcceptedRemote)
            }
            Action::Requeue(operation, payload) => {
                let record = self
                    .queue
                    .rewrite_conflicted(&conflict.record_id, &conflict.entity, operation, payload)
                    .await?;
                Ok(ResolutionOutcome::Requeued(record))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordStatus;
    use offsync_storage::MemoryLog;
    use serde_json::json;

    fn conflict_for(operation: Operation, local: serde_json::Value, server: serde_json::Value) -> SyncConflict {
        let record = SyncRecord::new(
            0,
            EntityKey::new("note", "1").unwrap(),
            operation,
            serde_json::to_vec(&local).unwrap(),
        );
        SyncConflict::from_record(&record, serde_json::to_vec(&server).unwrap())
    }

    struct Fixture {
        resolver: ConflictResolver,
        store: Arc<ConflictStore>,
        queue: Arc<OfflineQueue>,
        cache: Arc<CacheStore<Vec<u8>>>,
        events: EventBus,
    }

    async fn fixture() -> Fixture {
        let log: Arc<dyn LogStore> = Arc::new(MemoryLog::new());
        let store = Arc::new(ConflictStore::open(log.clone()).await.unwrap());
        let queue = Arc::new(OfflineQueue::open(log).await.unwrap());
        let cache = Arc::new(CacheStore::new(16));
        let events = EventBus::new();
        let resolver = ConflictResolver::new(store.clone(), queue.clone(), events.clone())
            .with_cache(cache.clone(), 60);
        Fixture {
            resolver,
            store,
            queue,
            cache,
            events,
        }
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "server-wins".parse::<ConflictResolution>().unwrap(),
            ConflictResolution::ServerWins
        );
        assert_eq!(
            "CLIENT_WINS".parse::<ConflictResolution>().unwrap(),
            ConflictResolution::ClientWins
        );
        assert!("coin-flip".parse::<ConflictResolution>().is_err());
    }

    #[test]
    fn test_json_merge_prefers_local_on_shared_fields() {
        let conflict = conflict_for(
            Operation::Update,
            json!({"title": "local", "body": "mine"}),
            json!({"title": "server", "tags": ["a"]}),
        );

        let MergeResult::Merged(bytes) = JsonFieldMerge.merge(&conflict) else {
            panic!("expected merge");
        };
        let merged: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(merged, json!({"title": "local", "body": "mine", "tags": ["a"]}));
    }

    #[test]
    fn test_json_merge_flags_non_objects() {
        let conflict = conflict_for(Operation::Update, json!([1, 2]), json!({"a": 1}));
        assert!(matches!(JsonFieldMerge.merge(&conflict), MergeResult::NeedsManual(_)));

        let conflict = conflict_for(Operation::Delete, json!({}), json!({}));
        assert!(matches!(JsonFieldMerge.merge(&conflict), MergeResult::NeedsManual(_)));
    }

    #[tokio::test]
    async fn test_store_persists_until_removed() {
        let log = MemoryLog::new();
        let shared: Arc<dyn LogStore> = Arc::new(log.clone());
        let store = ConflictStore::open(shared.clone()).await.unwrap();
        let first = store
            .add(conflict_for(Operation::Update, json!({}), json!({})))
            .await
            .unwrap();
        let second = store
            .add(conflict_for(Operation::Update, json!({}), json!({})))
            .await
            .unwrap();

        store.remove(&first.id).await.unwrap();
        assert!(store.remove(&first.id).await.is_err());

        let reopened = ConflictStore::open(shared).await.unwrap();
        let ids: Vec<_> = reopened.list().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.id]);
    }

    #[tokio::test]
    async fn test_add_replaces_conflict_for_same_record() {
        let f = fixture().await;
        let original = conflict_for(Operation::Update, json!({"v": 1}), json!({"v": 2}));
        let mut again = original.clone();
        again.id = ConflictId::new();
        again.server_data = serde_json::to_vec(&json!({"v": 3})).unwrap();

        let first = f.store.add(original).await.unwrap();
        let second = f.store.add(again).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(f.store.len(), 1);
        assert_eq!(f.store.list()[0].server_data, second.server_data);
    }

    #[tokio::test]
    async fn test_server_wins_refreshes_cache() {
        let f = fixture().await;
        let mut rx = f.events.receiver();
        let conflict = f
            .store
            .add(conflict_for(Operation::Update, json!({"v": 1}), json!({"v": 2})))
            .await
            .unwrap();

        let outcome = f
            .resolver
            .resolve(&conflict.id, ConflictResolution::ServerWins)
            .await
            .unwrap();

        assert_eq!(outcome, ResolutionOutcome::AcceptedRemote);
        assert!(f.store.is_empty());
        assert!(f.queue.is_empty());
        assert_eq!(f.cache.get("note/1"), Some(conflict.server_data.clone()));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SyncEvent::ConflictResolved {
                resolution: ConflictResolution::ServerWins,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_client_wins_rewrites_parked_record() {
        let f = fixture().await;
        let record = f
            .queue
            .enqueue("note", "1", Operation::Update, b"{\"v\":1}".to_vec())
            .await
            .unwrap();
        f.queue.mark_in_progress(&record.id).await.unwrap();
        f.queue.mark_conflict(&record.id).await.unwrap();
        let conflict = f
            .store
            .add(SyncConflict::from_record(&record, b"{\"v\":2}".to_vec()))
            .await
            .unwrap();

        let ResolutionOutcome::Requeued(rewritten) = f
            .resolver
            .resolve(&conflict.id, ConflictResolution::ClientWins)
            .await
            .unwrap()
        else {
            panic!("expected requeue");
        };
        assert_eq!(rewritten.id, record.id);
        assert_eq!(rewritten.status, RecordStatus::Pending);
        assert!(rewritten.forced);
        assert_eq!(f.queue.len(), 1);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_server_wins_drops_parked_record() {
        let f = fixture().await;
        let record = f
            .queue
            .enqueue("note", "1", Operation::Update, vec![1])
            .await
            .unwrap();
        f.queue.mark_in_progress(&record.id).await.unwrap();
        f.queue.mark_conflict(&record.id).await.unwrap();
        let conflict = f
            .store
            .add(SyncConflict::from_record(&record, vec![2]))
            .await
            .unwrap();

        f.resolver
            .resolve(&conflict.id, ConflictResolution::ServerWins)
            .await
            .unwrap();
        assert!(f.queue.is_empty());
        assert_eq!(f.cache.get("note/1"), Some(vec![2]));
    }

    #[tokio::test]
    async fn test_claimed_conflict_cannot_be_resolved_twice() {
        let f = fixture().await;
        let conflict = f
            .store
            .add(conflict_for(Operation::Update, json!({}), json!({})))
            .await
            .unwrap();

        f.store.claim(&conflict.id).unwrap();
        let err = f
            .resolver
            .resolve(&conflict.id, ConflictResolution::ServerWins)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(f.store.len(), 1);

        f.store.unclaim(&conflict.id);
        f.resolver
            .resolve(&conflict.id, ConflictResolution::ServerWins)
            .await
            .unwrap();
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_client_wins_queues_at_tail_when_record_is_gone() {
        let f = fixture().await;
        let conflict = f
            .store
            .add(conflict_for(Operation::Update, json!({"v": 1}), json!({"v": 2})))
            .await
            .unwrap();

        let outcome = f
            .resolver
            .resolve(&conflict.id, ConflictResolution::ClientWins)
            .await
            .unwrap();

        let ResolutionOutcome::Requeued(record) = outcome else {
            panic!("expected requeue");
        };
        assert!(record.forced);
        assert_ne!(record.id, conflict.record_id);
        assert_eq!(record.payload, conflict.local_data);
        assert_eq!(record.operation, Operation::Update);
        assert_eq!(f.queue.len(), 1);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_merge_requeues_merged_payload() {
        let f = fixture().await;
        let conflict = f
            .store
            .add(conflict_for(Operation::Create, json!({"a": 1}), json!({"b": 2})))
            .await
            .unwrap();

        let ResolutionOutcome::Requeued(record) = f
            .resolver
            .resolve(&conflict.id, ConflictResolution::Merge)
            .await
            .unwrap()
        else {
            panic!("expected requeue");
        };
        let merged: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
        assert_eq!(merged, json!({"a": 1, "b": 2}));
        assert_eq!(record.operation, Operation::Update);
    }

    #[tokio::test]
    async fn test_manual_requires_payload() {
        let f = fixture().await;
        let conflict = f
            .store
            .add(conflict_for(Operation::Update, json!("text"), json!("other")))
            .await
            .unwrap();

        let err = f
            .resolver
            .resolve(&conflict.id, ConflictResolution::ManualResolution)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManualResolutionRequired(_)));

        // Unmergeable payloads also stay put.
        let err = f
            .resolver
            .resolve(&conflict.id, ConflictResolution::Merge)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManualResolutionRequired(_)));
        assert_eq!(f.store.len(), 1);

        let outcome = f
            .resolver
            .resolve_manually(&conflict.id, b"\"merged\"".to_vec())
            .await
            .unwrap();
        assert!(matches!(outcome, ResolutionOutcome::Requeued(_)));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_custom_merger() {
        let f = fixture().await;
        let resolver = ConflictResolver::new(f.store.clone(), f.queue.clone(), f.events.clone())
            .with_merger(Arc::new(|c: &SyncConflict| MergeResult::Merged(c.server_data.clone())));
        let conflict = f
            .store
            .add(conflict_for(Operation::Update, json!(1), json!(2)))
            .await
            .unwrap();

        let ResolutionOutcome::Requeued(record) = resolver
            .resolve(&conflict.id, ConflictResolution::Merge)
            .await
            .unwrap()
        else {
            panic!("expected requeue");
        };
        assert_eq!(record.payload, conflict.server_data);
    }

    #[tokio::test]
    async fn test_resolve_unknown_conflict() {
        let f = fixture().await;
        let err = f
            .resolver
            .resolve(&ConflictId::new(), ConflictResolution::ServerWins)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
