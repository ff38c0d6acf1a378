//! Sync policy - periodic auto-sync, gating conditions and manual triggers.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use offsync_common::{Error, Result};

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::status::SyncReport;

/// Device state consulted before automatic passes.
pub trait SyncConditions: Send + Sync {
    fn is_on_wifi(&self) -> bool;
    fn is_charging(&self) -> bool;
}

/// Conditions that never block a pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAllow;

impl SyncConditions for AlwaysAllow {
    fn is_on_wifi(&self) -> bool {
        true
    }

    fn is_charging(&self) -> bool {
        true
    }
}

fn check_gates(config: &SyncConfig, conditions: &dyn SyncConditions) -> Result<()> {
    if config.sync_only_on_wifi && !conditions.is_on_wifi() {
        return Err(Error::GatingConditionNotMet("not on wifi".to_string()));
    }
    if config.sync_only_when_charging && !conditions.is_charging() {
        return Err(Error::GatingConditionNotMet("not charging".to_string()));
    }
    Ok(())
}

struct AutoSync {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    sweeper: Option<JoinHandle<()>>,
}

/// Wraps the engine with scheduling and gating policy.
pub struct SyncManager {
    engine: Arc<SyncEngine>,
    conditions: Arc<dyn SyncConditions>,
    auto: Mutex<Option<AutoSync>>,
}

impl SyncManager {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            conditions: Arc::new(AlwaysAllow),
            auto: Mutex::new(None),
        }
    }

    pub fn with_conditions(mut self, conditions: Arc<dyn SyncConditions>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Evaluate the configured gating predicates.
    ///
    /// # Errors
    /// - `GatingConditionNotMet` naming the first predicate that failed
    pub fn check_gates(&self) -> Result<()> {
        check_gates(self.engine.config(), self.conditions.as_ref())
    }

    /// Start the periodic loop. The first pass runs immediately, then one
    /// per sync interval; passes whose gates fail are skipped. If the engine
    /// has a cache, expired entries are swept every sweep interval while
    /// auto-sync is on.
    ///
    /// Must be called from within a tokio runtime. Does nothing if auto-sync
    /// is already enabled.
    pub fn enable_auto_sync(&self) {
        let mut auto = self.auto.lock().unwrap_or_else(PoisonError::into_inner);
        if auto.as_ref().is_some_and(|a| !a.task.is_finished()) {
            debug!("Auto-sync already enabled");
            return;
        }

        let cancel = CancellationToken::new();
        let engine = self.engine.clone();
        let conditions = self.conditions.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            run_auto_sync(engine, conditions, token).await;
        });
        let sweeper = self.engine.cache().map(|cache| {
            cache.spawn_sweeper(self.engine.config().sweep_interval(), cancel.child_token())
        });

        info!(
            "Auto-sync enabled every {:?}",
            self.engine.config().sync_interval()
        );
        *auto = Some(AutoSync {
            cancel,
            task,
            sweeper,
        });
    }

    /// Stop the periodic loop and cancel any running pass.
    ///
    /// Returns once the loop has exited; an in-flight pass finishes its
    /// outstanding records first.
    pub async fn disable_auto_sync(&self) {
        let auto = self
            .auto
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(auto) = auto else {
            return;
        };

        auto.cancel.cancel();
        self.engine.stop();
        if let Err(e) = auto.task.await {
            error!("Auto-sync task ended abnormally: {}", e);
        }
        if let Some(sweeper) = auto.sweeper {
            if let Err(e) = sweeper.await {
                error!("Cache sweeper ended abnormally: {}", e);
            }
        }
        info!("Auto-sync disabled");
    }

    pub fn is_auto_sync_enabled(&self) -> bool {
        self.auto
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|a| !a.task.is_finished())
    }

    /// Run a pass now, regardless of the interval or gating predicates.
    ///
    /// # Errors
    /// - `ConcurrentSyncRejected` if a pass is already running
    /// - Whatever aborts the pass
    pub async fn sync_now(&self) -> Result<SyncReport> {
        info!("Manual sync requested");
        self.engine.sync().await
    }
}

async fn run_auto_sync(
    engine: Arc<SyncEngine>,
    conditions: Arc<dyn SyncConditions>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(engine.config().sync_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = check_gates(engine.config(), conditions.as_ref()) {
            debug!("Skipping auto sync: {}", e);
            continue;
        }

        match engine.sync().await {
            Ok(report) => debug!(
                "Auto sync finished: {} synced, {} failed, {} conflicts",
                report.synced, report.failed, report.conflicts
            ),
            Err(Error::ConcurrentSyncRejected) => {
                debug!("Auto sync skipped, a pass is already running")
            }
            Err(e) => error!("Auto sync failed: {}", e),
        }
    }

    debug!("Auto-sync loop exited");
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        if let Some(auto) = self
            .auto
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            auto.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::conflict::ConflictStore;
    use crate::events::{EventBus, SyncEvent};
    use crate::executor::{ExecutionOutcome, MutationRequest, RemoteExecutor};
    use crate::queue::OfflineQueue;
    use crate::record::Operation;
    use async_trait::async_trait;
    use offsync_storage::{LogStore, MemoryLog};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    struct ApplyAll;

    #[async_trait]
    impl RemoteExecutor for ApplyAll {
        async fn execute(&self, _request: MutationRequest<'_>, _deadline: Instant) -> ExecutionOutcome {
            ExecutionOutcome::Applied(None)
        }
    }

    #[derive(Default)]
    struct Device {
        wifi: AtomicBool,
        charging: AtomicBool,
    }

    impl SyncConditions for Device {
        fn is_on_wifi(&self) -> bool {
            self.wifi.load(Ordering::SeqCst)
        }

        fn is_charging(&self) -> bool {
            self.charging.load(Ordering::SeqCst)
        }
    }

    async fn manager(config: SyncConfig, device: Arc<Device>) -> (SyncManager, Arc<AtomicUsize>) {
        let log: Arc<dyn LogStore> = Arc::new(MemoryLog::new());
        let queue = Arc::new(OfflineQueue::open(log.clone()).await.unwrap());
        let conflicts = Arc::new(ConflictStore::open(log).await.unwrap());
        let events = EventBus::new();

        let passes = Arc::new(AtomicUsize::new(0));
        let counter = passes.clone();
        events.subscribe(Arc::new(move |event: &SyncEvent| {
            if matches!(event, SyncEvent::SyncStarted { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let cache = Arc::new(CacheStore::new(config.cache_capacity));
        let engine = SyncEngine::new(queue, conflicts, Arc::new(ApplyAll), config, events)
            .unwrap()
            .with_cache(cache);
        let manager = SyncManager::new(Arc::new(engine)).with_conditions(device);
        (manager, passes)
    }

    #[tokio::test]
    async fn test_gates() {
        let device = Arc::new(Device::default());
        let config = SyncConfig::default().with_wifi_only(true).with_charging_only(true);
        let (manager, _) = manager(config, device.clone()).await;

        assert!(matches!(
            manager.check_gates(),
            Err(Error::GatingConditionNotMet(reason)) if reason.contains("wifi")
        ));
        device.wifi.store(true, Ordering::SeqCst);
        assert!(matches!(
            manager.check_gates(),
            Err(Error::GatingConditionNotMet(reason)) if reason.contains("charging")
        ));
        device.charging.store(true, Ordering::SeqCst);
        assert!(manager.check_gates().is_ok());
    }

    #[tokio::test]
    async fn test_sync_now_ignores_gates() {
        let device = Arc::new(Device::default());
        let (manager, passes) = manager(SyncConfig::default().with_wifi_only(true), device).await;
        manager
            .engine()
            .queue()
            .enqueue("note", "1", Operation::Create, vec![])
            .await
            .unwrap();

        let report = manager.sync_now().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_sync_runs_each_interval() {
        let config = SyncConfig::default().with_sync_interval(Duration::from_secs(10));
        let (manager, passes) = manager(config, Arc::new(Device::default())).await;

        manager.enable_auto_sync();
        manager.enable_auto_sync();
        assert!(manager.is_auto_sync_enabled());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 3);

        manager.disable_auto_sync().await;
        assert!(!manager.is_auto_sync_enabled());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_sync_sweeps_expired_cache_entries() {
        let config = SyncConfig::default()
            .with_sync_interval(Duration::from_secs(600))
            .with_sweep_interval(Duration::from_secs(5));
        let (manager, _) = manager(config, Arc::new(Device::default())).await;
        let cache = manager.engine().cache().unwrap().clone();
        cache.put("note/1".to_string(), vec![1], 2);
        cache.put("note/2".to_string(), vec![2], 600);

        manager.enable_auto_sync();
        tokio::time::sleep(Duration::from_secs(6)).await;
        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.expired, 0);

        manager.disable_auto_sync().await;
    }
}
