//! Durable persistence for the offline sync core.
//!
//! This module provides a trait-based append log used by the offline queue
//! and the conflict store, with an in-memory backend for tests and a
//! JSON-lines file backend for real sessions.
//!
//! # Design Principles
//! - Append-only: owners never patch entries in place
//! - Versioned entries: replay keeps the highest version per key
//! - Async operations: all I/O operations are async

pub mod local;
pub mod log;
pub mod memory;

pub use local::FileLog;
pub use log::{fold_entries, LogEntry, LogStore};
pub use memory::MemoryLog;
