//! Fan-out notification of sync lifecycle events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

use offsync_common::{ConflictId, EntityKey};

use crate::conflict::ConflictResolution;

/// Buffered events per channel subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Lifecycle event published by the engine and the conflict resolver.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SyncStarted {
        pending: usize,
    },
    SyncProgress {
        progress: u8,
        processed: usize,
        total: usize,
    },
    SyncCompleted {
        records_synced: usize,
        duration: Duration,
    },
    SyncFailed {
        error: String,
    },
    /// The pass was stopped before draining its snapshot.
    SyncStopped {
        records_synced: usize,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        entity: EntityKey,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        entity: EntityKey,
        resolution: ConflictResolution,
    },
}

/// Receives events synchronously on the publishing task.
///
/// Implementations must not block.
pub trait SyncListener: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

impl<F> SyncListener for F
where
    F: Fn(&SyncEvent) + Send + Sync,
{
    fn on_event(&self, event: &SyncEvent) {
        self(event)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct BusInner {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn SyncListener>)>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<SyncEvent>,
}

/// Event bus shared by the engine, resolver and observers.
///
/// Supports callback listeners and async channel receivers. Cloning yields
/// another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
                channel,
            }),
        }
    }

    /// Register a callback listener.
    pub fn subscribe(&self, listener: Arc<dyn SyncListener>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Remove a callback listener, returning whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Async receiver of every event published from now on.
    pub fn receiver(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.channel.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an event to every listener and channel receiver.
    pub fn publish(&self, event: SyncEvent) {
        let listeners: Vec<Arc<dyn SyncListener>> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener.on_event(&event);
        }

        // No receivers is fine.
        let _ = self.inner.channel.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<dyn SyncListener>, Arc<Mutex<Vec<SyncEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn SyncListener> =
            Arc::new(move |event: &SyncEvent| sink.lock().unwrap().push(event.clone()));
        (listener, seen)
    }

    #[test]
    fn test_subscribe_and_publish() {
        let bus = EventBus::new();
        let (listener, seen) = recorder();
        bus.subscribe(listener);

        bus.publish(SyncEvent::SyncStarted { pending: 2 });
        assert_eq!(seen.lock().unwrap().as_slice(), &[SyncEvent::SyncStarted { pending: 2 }]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (listener, seen) = recorder();
        let id = bus.subscribe(listener);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(SyncEvent::SyncFailed {
            error: "x".to_string(),
        });
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_receiver() {
        let bus = EventBus::new();
        let mut rx = bus.receiver();
        bus.clone().publish(SyncEvent::SyncStopped { records_synced: 1 });
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::SyncStopped { records_synced: 1 }
        );
    }
}
