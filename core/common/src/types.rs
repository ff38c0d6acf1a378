//! Identifier types used throughout the sync core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a queued mutation, assigned at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid record id '{}': {}", s, e)))
    }
}

/// Unique identifier of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid conflict id '{}': {}", s, e)))
    }
}

/// Routing key identifying one remote resource.
///
/// Mutations sharing an `EntityKey` are submitted strictly in enqueue order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    /// Create a new entity key.
    ///
    /// # Preconditions
    /// - Both parts must be non-empty
    ///
    /// # Errors
    /// - Returns error if either part is empty
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> crate::Result<Self> {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        if entity_type.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Entity type cannot be empty".to_string(),
            ));
        }
        if entity_id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Entity id cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            entity_type,
            entity_id,
        })
    }

    /// Key under which reads of this entity are cached.
    pub fn cache_key(&self) -> String {
        format!("{}/{}", self.entity_type, self.entity_id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_validation() {
        assert!(EntityKey::new("note", "42").is_ok());
        assert!(EntityKey::new("", "42").is_err());
        assert!(EntityKey::new("note", "").is_err());
    }

    #[test]
    fn test_cache_key_format() {
        let key = EntityKey::new("note", "42").unwrap();
        assert_eq!(key.cache_key(), "note/42");
        assert_eq!(key.to_string(), "note/42");
    }

    #[test]
    fn test_record_id_parse() {
        let id = RecordId::new();
        let parsed: RecordId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("nope".parse::<RecordId>().is_err());
    }
}
