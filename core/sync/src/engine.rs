//! Core sync engine that drains the offline queue against the remote service.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use offsync_common::{EntityKey, Error, Result};

use crate::cache::CacheStore;
use crate::config::SyncConfig;
use crate::conflict::{ConflictResolution, ConflictResolver, ConflictStore, Merger, SyncConflict};
use crate::events::{EventBus, SyncEvent};
use crate::executor::{ExecutionOutcome, MutationRequest, RemoteExecutor};
use crate::queue::OfflineQueue;
use crate::record::{Operation, RecordStatus, SyncRecord};
use crate::status::{progress_percent, SyncReport, SyncStatus};

/// How a single record left the engine's hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Synced,
    Retried,
    Failed,
    Conflicted,
    Deferred,
}

/// Clears the running flag however a pass ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives sync passes over the offline queue.
///
/// Only data-structure locks are taken; nothing is held across a remote call
/// or across the pass as a whole.
pub struct SyncEngine {
    queue: Arc<OfflineQueue>,
    conflicts: Arc<ConflictStore>,
    resolver: Arc<ConflictResolver>,
    executor: Arc<dyn RemoteExecutor>,
    cache: Option<Arc<CacheStore<Vec<u8>>>>,
    events: EventBus,
    config: SyncConfig,
    status: watch::Sender<SyncStatus>,
    /// `Some(reason)` while paused.
    paused: watch::Sender<Option<String>>,
    progress: AtomicU8,
    running: AtomicBool,
    /// Cancellation for the current pass.
    cancel: Mutex<CancellationToken>,
}

impl SyncEngine {
    /// Create a new sync engine.
    ///
    /// # Errors
    /// - `InvalidInput` if `config` fails validation
    pub fn new(
        queue: Arc<OfflineQueue>,
        conflicts: Arc<ConflictStore>,
        executor: Arc<dyn RemoteExecutor>,
        config: SyncConfig,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = ConflictResolver::new(conflicts.clone(), queue.clone(), events.clone());
        let (status, _) = watch::channel(SyncStatus::Idle);
        let (paused, _) = watch::channel(None);

        Ok(Self {
            queue,
            conflicts,
            resolver: Arc::new(resolver),
            executor,
            cache: None,
            events,
            config,
            status,
            paused,
            progress: AtomicU8::new(0),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// Keep `cache` in step with applied mutations and server-wins resolutions.
    pub fn with_cache(mut self, cache: Arc<CacheStore<Vec<u8>>>) -> Self {
        self.resolver = Arc::new(
            ConflictResolver::new(self.conflicts.clone(), self.queue.clone(), self.events.clone())
                .with_cache(cache.clone(), self.config.cache_ttl_secs),
        );
        self.cache = Some(cache);
        self
    }

    /// Use a custom merge function for `Merge` resolutions.
    pub fn with_merger(mut self, merger: Arc<dyn Merger>) -> Self {
        let mut resolver =
            ConflictResolver::new(self.conflicts.clone(), self.queue.clone(), self.events.clone())
                .with_merger(merger);
        if let Some(cache) = &self.cache {
            resolver = resolver.with_cache(cache.clone(), self.config.cache_ttl_secs);
        }
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn conflicts(&self) -> &Arc<ConflictStore> {
        &self.conflicts
    }

    pub fn cache(&self) -> Option<&Arc<CacheStore<Vec<u8>>>> {
        self.cache.as_ref()
    }

    /// Resolver for manual or deferred conflict resolution.
    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Live status stream.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Halt dispatch of new records; in-flight calls run to completion and
    /// the engine then returns to `Idle`.
    pub fn stop(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        if !self.is_running() {
            self.status.send_replace(SyncStatus::Idle);
        }
    }

    /// Suspend dispatch of new records in the running pass.
    ///
    /// # Errors
    /// - `InvalidInput` if no pass is running
    pub fn pause(&self, reason: impl Into<String>) -> Result<()> {
        if !self.is_running() {
            return Err(Error::InvalidInput("No sync pass is running".to_string()));
        }
        let reason = reason.into();
        info!("Pausing sync: {}", reason);
        self.paused.send_replace(Some(reason.clone()));
        self.status.send_replace(SyncStatus::Paused { reason });
        Ok(())
    }

    /// Continue a paused pass.
    ///
    /// # Errors
    /// - `InvalidInput` if the engine is not paused
    pub fn resume(&self) -> Result<()> {
        if self.paused.borrow().is_none() || !self.is_running() {
            return Err(Error::InvalidInput("Sync is not paused".to_string()));
        }
        info!("Resuming sync");
        self.paused.send_replace(None);
        self.status.send_replace(SyncStatus::InProgress {
            progress: self.progress.load(Ordering::Acquire),
            message: "resumed".to_string(),
        });
        Ok(())
    }

    /// Run one sync pass over every record pending at its start.
    ///
    /// # Errors
    /// - `ConcurrentSyncRejected` if a pass is already running
    /// - Queue or conflict-store failures, which abort the pass with `Failed`
    pub async fn sync(&self) -> Result<SyncReport> {
        let cancel = {
            let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(Error::ConcurrentSyncRejected);
            }
            *slot = CancellationToken::new();
            slot.clone()
        };
        let _running = RunningGuard(&self.running);
        self.paused.send_replace(None);

        let start = Instant::now();
        match self.run_pass(&cancel, start).await {
            Ok(report) if report.cancelled => {
                info!("Sync stopped after {} records", report.synced);
                self.status.send_replace(SyncStatus::Idle);
                self.events.publish(SyncEvent::SyncStopped {
                    records_synced: report.synced,
                });
                Ok(report)
            }
            Ok(report) => {
                info!(
                    "Sync completed in {:?}: {} synced, {} failed, {} retried, {} conflicts, {} deferred",
                    report.duration,
                    report.synced,
                    report.failed,
                    report.retried,
                    report.conflicts,
                    report.deferred
                );
                self.status.send_replace(SyncStatus::Completed {
                    records_synced: report.synced,
                    duration: report.duration,
                });
                self.events.publish(SyncEvent::SyncCompleted {
                    records_synced: report.synced,
                    duration: report.duration,
                });
                Ok(report)
            }
            Err(e) => {
                error!("Sync pass aborted: {}", e);
                self.status.send_replace(SyncStatus::Failed {
                    error: e.to_string(),
                    retry_count: 0,
                });
                self.events.publish(SyncEvent::SyncFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_pass(&self, cancel: &CancellationToken, start: Instant) -> Result<SyncReport> {
        self.progress.store(0, Ordering::Release);
        self.status.send_replace(SyncStatus::InProgress {
            progress: 0,
            message: "starting".to_string(),
        });

        let snapshot = self.queue.dequeue_batch(usize::MAX);
        let total = snapshot.len();
        info!("Starting sync of {} pending records", total);
        self.events.publish(SyncEvent::SyncStarted { pending: total });

        // Cancelled on infrastructure errors; also fires when `cancel` does.
        let abort = cancel.child_token();
        let failure: Mutex<Option<Error>> = Mutex::new(None);
        let report = Mutex::new(SyncReport::default());
        let processed = AtomicUsize::new(0);

        for batch in snapshot.chunks(self.config.batch_size.max(1)) {
            if abort.is_cancelled() {
                break;
            }
            debug!("Dispatching batch of {} records", batch.len());
            self.run_batch(batch, &abort, &failure, &report, &processed, total)
                .await;
        }

        if let Some(e) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(e);
        }

        let mut report = report.into_inner().unwrap_or_else(PoisonError::into_inner);
        report.duration = start.elapsed();
        report.cancelled = cancel.is_cancelled();
        Ok(report)
    }

    /// Process one batch: records of the same entity run in order on one
    /// chain, distinct entities run concurrently up to the in-flight limit.
    async fn run_batch(
        &self,
        batch: &[SyncRecord],
        abort: &CancellationToken,
        failure: &Mutex<Option<Error>>,
        report: &Mutex<SyncReport>,
        processed: &AtomicUsize,
        total: usize,
    ) {
        let mut chains: Vec<Vec<&SyncRecord>> = Vec::new();
        let mut chain_of: HashMap<&EntityKey, usize> = HashMap::new();
        for record in batch {
            let index = *chain_of.entry(&record.entity).or_insert_with(|| {
                chains.push(Vec::new());
                chains.len() - 1
            });
            chains[index].push(record);
        }

        stream::iter(chains)
            .for_each_concurrent(Some(self.config.in_flight_limit()), |chain| async move {
                for record in chain {
                    self.wait_while_paused(abort).await;
                    if abort.is_cancelled() {
                        break;
                    }

                    match self.process_record(record).await {
                        Ok(outcome) => {
                            let mut report =
                                report.lock().unwrap_or_else(PoisonError::into_inner);
                            match outcome {
                                RecordOutcome::Synced => report.synced += 1,
                                RecordOutcome::Retried => report.retried += 1,
                                RecordOutcome::Failed => report.failed += 1,
                                RecordOutcome::Conflicted => report.conflicts += 1,
                                RecordOutcome::Deferred => report.deferred += 1,
                            }
                        }
                        Err(e) => {
                            failure
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .get_or_insert(e);
                            abort.cancel();
                            break;
                        }
                    }

                    let done = processed.fetch_add(1, Ordering::AcqRel) + 1;
                    self.emit_progress(done, total);
                }
            })
            .await;
    }

    async fn wait_while_paused(&self, abort: &CancellationToken) {
        let mut paused = self.paused.subscribe();
        tokio::select! {
            _ = paused.wait_for(|reason| reason.is_none()) => {}
            _ = abort.cancelled() => {}
        }
    }

    fn emit_progress(&self, processed: usize, total: usize) {
        let progress = progress_percent(processed, total);
        self.progress.store(progress, Ordering::Release);
        if self.paused.borrow().is_none() {
            self.status.send_replace(SyncStatus::InProgress {
                progress,
                message: format!("{}/{} records", processed, total),
            });
        }
        self.events.publish(SyncEvent::SyncProgress {
            progress,
            processed,
            total,
        });
    }

    /// Submit one record and apply the outcome to the queue.
    ///
    /// Per-record failures are recorded on the record; only queue or store
    /// errors are returned. A record whose outcome could not be recorded is
    /// put back to `PENDING` and resubmitted by a later pass.
    async fn process_record(&self, record: &SyncRecord) -> Result<RecordOutcome> {
        let record = match self.queue.mark_in_progress(&record.id).await {
            Ok(record) => record,
            Err(Error::OutOfOrder { id, entity }) => {
                debug!("Deferring {}: earlier mutation of {} unfinished", id, entity);
                return Ok(RecordOutcome::Deferred);
            }
            // Changed since the snapshot (requeued, removed by an operator).
            Err(Error::InvalidStateTransition { .. }) | Err(Error::NotFound(_)) => {
                return Ok(RecordOutcome::Deferred);
            }
            Err(e) => return Err(e),
        };

        let timeout = self.config.request_timeout();
        let deadline = Instant::now() + timeout;
        let outcome = timeout_at(
            deadline,
            self.executor.execute(MutationRequest::from(&record), deadline),
        )
        .await
        .unwrap_or_else(|_| ExecutionOutcome::Retryable(format!("timed out after {:?}", timeout)));

        let settled = self.settle(&record, outcome).await;
        if settled.is_err() {
            self.queue.release(&record.id).await;
        }
        settled
    }

    async fn settle(&self, record: &SyncRecord, outcome: ExecutionOutcome) -> Result<RecordOutcome> {
        match outcome {
            ExecutionOutcome::Applied(server_data) => {
                self.queue.mark_completed(&record.id).await?;
                self.queue.remove(&record.id).await?;
                self.refresh_cache(record, server_data);
                debug!("Applied {} {} on {}", record.id, record.operation, record.entity);
                Ok(RecordOutcome::Synced)
            }
            ExecutionOutcome::Conflict(server_data) => {
                self.handle_conflict(record, server_data).await?;
                Ok(RecordOutcome::Conflicted)
            }
            ExecutionOutcome::Retryable(reason) => {
                let updated = self
                    .queue
                    .mark_retryable(
                        &record.id,
                        Error::RetryableExecution(reason.clone()).to_string(),
                        self.config.retry_attempts,
                    )
                    .await?;
                if updated.status == RecordStatus::Failed {
                    warn!(
                        "Record {} failed after {} attempts: {}",
                        updated.id, updated.retry_count, reason
                    );
                    Ok(RecordOutcome::Failed)
                } else {
                    debug!(
                        "Record {} will be retried (attempt {}): {}",
                        updated.id, updated.retry_count, reason
                    );
                    Ok(RecordOutcome::Retried)
                }
            }
            ExecutionOutcome::Fatal(reason) => {
                warn!("Record {} rejected: {}", record.id, reason);
                self.queue
                    .mark_failed(&record.id, Error::FatalExecution(reason).to_string())
                    .await?;
                Ok(RecordOutcome::Failed)
            }
        }
    }

    fn refresh_cache(&self, record: &SyncRecord, server_data: Option<Vec<u8>>) {
        let Some(cache) = &self.cache else {
            return;
        };
        let key = record.entity.cache_key();
        match (record.operation, server_data) {
            (Operation::Delete, _) | (_, None) => {
                cache.remove(&key);
            }
            (_, Some(data)) => cache.put(key, data, self.config.cache_ttl_secs),
        }
    }

    async fn handle_conflict(&self, record: &SyncRecord, server_data: Vec<u8>) -> Result<()> {
        // Store first; a crash before the record is parked resubmits it and
        // the store replaces the conflict.
        let conflict = self
            .conflicts
            .add(SyncConflict::from_record(record, server_data))
            .await?;
        self.queue.mark_conflict(&record.id).await?;

        info!("Conflict {} detected on {}", conflict.id, conflict.entity);
        self.events.publish(SyncEvent::ConflictDetected {
            conflict_id: conflict.id,
            entity: conflict.entity.clone(),
        });

        let strategy = self.config.conflict_resolution;
        if strategy == ConflictResolution::ManualResolution {
            return Ok(());
        }
        match self.resolver.resolve(&conflict.id, strategy).await {
            Ok(_) => Ok(()),
            Err(Error::ManualResolutionRequired(reason)) => {
                debug!("Leaving conflict {} for manual resolution: {}", conflict.id, reason);
                Ok(())
            }
            // Claimed by a caller resolving it by hand.
            Err(Error::InvalidInput(reason)) => {
                debug!("Skipping automatic resolution of {}: {}", conflict.id, reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use offsync_storage::{LogStore, MemoryLog};

    struct ApplyAll;

    #[async_trait]
    impl RemoteExecutor for ApplyAll {
        async fn execute(&self, request: MutationRequest<'_>, _deadline: Instant) -> ExecutionOutcome {
            ExecutionOutcome::Applied(Some(request.payload.to_vec()))
        }
    }

    struct Hang;

    #[async_trait]
    impl RemoteExecutor for Hang {
        async fn execute(&self, _request: MutationRequest<'_>, _deadline: Instant) -> ExecutionOutcome {
            futures::future::pending().await
        }
    }

    async fn engine(executor: Arc<dyn RemoteExecutor>, config: SyncConfig) -> SyncEngine {
        let log: Arc<dyn LogStore> = Arc::new(MemoryLog::new());
        let queue = Arc::new(OfflineQueue::open(log.clone()).await.unwrap());
        let conflicts = Arc::new(ConflictStore::open(log).await.unwrap());
        SyncEngine::new(queue, conflicts, executor, config, EventBus::new()).unwrap()
    }

    #[tokio::test]
    async fn test_empty_queue_completes() {
        let engine = engine(Arc::new(ApplyAll), SyncConfig::default()).await;
        assert_eq!(engine.current_status(), SyncStatus::Idle);

        let report = engine.sync().await.unwrap();
        assert_eq!(report.synced, 0);
        assert!(matches!(
            engine.current_status(),
            SyncStatus::Completed { records_synced: 0, .. }
        ));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_applied_updates_cache() {
        let cache = Arc::new(CacheStore::new(8));
        let engine = engine(Arc::new(ApplyAll), SyncConfig::default())
            .await
            .with_cache(cache.clone());
        engine
            .queue()
            .enqueue("note", "1", Operation::Create, b"v1".to_vec())
            .await
            .unwrap();
        engine.sync().await.unwrap();
        assert_eq!(cache.get("note/1"), Some(b"v1".to_vec()));

        engine
            .queue()
            .enqueue("note", "1", Operation::Delete, vec![])
            .await
            .unwrap();
        engine.sync().await.unwrap();
        assert!(!cache.contains("note/1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let config = SyncConfig::default()
            .with_request_timeout(std::time::Duration::from_secs(1))
            .with_retry_attempts(3);
        let engine = engine(Arc::new(Hang), config).await;
        let record = engine
            .queue()
            .enqueue("note", "1", Operation::Update, vec![])
            .await
            .unwrap();

        let report = engine.sync().await.unwrap();
        assert_eq!(report.retried, 1);

        let stored = engine.queue().get(&record.id).unwrap();
        assert_eq!(stored.status, RecordStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        let error = stored.last_error.unwrap();
        assert!(error.starts_with("Retryable execution error"));
        assert!(error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let log: Arc<dyn LogStore> = Arc::new(MemoryLog::new());
        let queue = Arc::new(OfflineQueue::open(log.clone()).await.unwrap());
        let conflicts = Arc::new(ConflictStore::open(log).await.unwrap());

        let config = SyncConfig::default().with_sync_interval(std::time::Duration::ZERO);
        let result = SyncEngine::new(queue, conflicts, Arc::new(ApplyAll), config, EventBus::new());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_pause_requires_running_pass() {
        let engine = engine(Arc::new(ApplyAll), SyncConfig::default()).await;
        assert!(engine.pause("battery").is_err());
        assert!(engine.resume().is_err());
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let engine = engine(Arc::new(ApplyAll), SyncConfig::default()).await;
        engine.sync().await.unwrap();
        engine.stop();
        assert_eq!(engine.current_status(), SyncStatus::Idle);

        // A stop between passes does not cancel the next one.
        engine
            .queue()
            .enqueue("note", "1", Operation::Create, vec![])
            .await
            .unwrap();
        let report = engine.sync().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(!report.cancelled);
    }
}
