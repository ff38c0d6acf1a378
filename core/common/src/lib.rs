//! Common utilities and types shared across the offline sync crates.
//!
//! This module provides the error taxonomy and identifier types used by the
//! storage, sync and tooling crates.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ConflictId, EntityKey, RecordId};
