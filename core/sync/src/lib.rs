//! Offline-first sync core.
//!
//! This module provides the pieces an application needs to keep working
//! without connectivity, including:
//! - A durable, per-entity ordered offline queue of local mutations
//! - A bounded TTL + LRU cache for remote reads
//! - Conflict detection, storage and resolution strategies
//! - A sync engine with bounded concurrent dispatch and cancellation
//! - Periodic auto-sync gated on device conditions

pub mod cache;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod events;
pub mod executor;
pub mod manager;
pub mod queue;
pub mod reader;
pub mod record;
pub mod status;

// Re-export main types
pub use cache::{CacheEntry, CacheStats, CacheStore};
pub use config::SyncConfig;
pub use conflict::{
    ConflictResolution, ConflictResolver, ConflictStore, JsonFieldMerge, MergeResult, Merger,
    ResolutionOutcome, SyncConflict,
};
pub use engine::SyncEngine;
pub use events::{EventBus, SubscriptionId, SyncEvent, SyncListener};
pub use executor::{ExecutionOutcome, MutationRequest, RemoteExecutor, RemoteReader};
pub use manager::{AlwaysAllow, SyncConditions, SyncManager};
pub use queue::OfflineQueue;
pub use reader::ReadThrough;
pub use record::{Operation, RecordStatus, SyncRecord};
pub use status::{SyncReport, SyncStatus};
