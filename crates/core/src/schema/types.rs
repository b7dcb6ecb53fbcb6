use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::cache::{storage_key_for, CacheError, Result, ESCAPED_SPLIT_SEQUENCE};

/// Selects the storage layout of an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheType {
    /// Rows live in one hash per type, keyed by business key.
    #[default]
    Normal,
    /// Rows live in one sorted set per leaderboard key, ordered by score.
    Rank,
}

bitflags! {
    /// Which directions of traffic against the stores are enabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StorageType: u32 {
        const READ_ONLY_DB = 0b0001;
        const READ_WRITE_DB = 0b0010;
        const READ_ONLY_REMOTE = 0b0100;
        const READ_WRITE_REMOTE = 0b1000;
    }
}

impl StorageType {
    /// Whether rows may be read from the remote store.
    pub fn reads_remote(&self) -> bool {
        self.intersects(StorageType::READ_ONLY_REMOTE | StorageType::READ_WRITE_REMOTE)
    }

    /// Whether rows may be written to the remote store.
    pub fn writes_remote(&self) -> bool {
        self.contains(StorageType::READ_WRITE_REMOTE)
    }
}

/// Storage format negotiated through the registration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum StorageVersion {
    /// One serialized value per key.
    Default = 0,
    /// One hash per entity type.
    Hash = 5,
    /// Hash storage plus a maintained index for composite keys.
    HashMultiKeyMap = 7,
}

impl StorageVersion {
    /// Whether rows are stored in per-type hashes.
    pub fn uses_hash_layout(&self) -> bool {
        *self >= StorageVersion::Hash
    }

    /// Whether composite key codes are indexed under their owning key.
    pub fn maintains_key_index(&self) -> bool {
        *self >= StorageVersion::HashMultiKeyMap
    }
}

impl Default for StorageVersion {
    fn default() -> Self {
        StorageVersion::HashMultiKeyMap
    }
}

impl TryFrom<u32> for StorageVersion {
    type Error = CacheError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(StorageVersion::Default),
            5 => Ok(StorageVersion::Hash),
            7 => Ok(StorageVersion::HashMultiKeyMap),
            other => Err(CacheError::InvalidConfig(format!(
                "unknown storage version: {}",
                other
            ))),
        }
    }
}

impl From<StorageVersion> for u32 {
    fn from(version: StorageVersion) -> Self {
        version as u32
    }
}

/// Per-entity-type metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaTable {
    /// Fully qualified type name.
    pub entity_name: String,
    /// Names of the business key fields, in key code order.
    pub keys: Vec<String>,
    pub cache_type: CacheType,
    pub storage_type: StorageType,
    /// Maximum rows kept per leaderboard. Zero means unbounded.
    pub capacity: usize,
    /// How long a loaded key stays fresh. `None` never expires.
    pub period: Option<Duration>,
}

impl SchemaTable {
    /// Creates a read/write remote schema for a plain hash-stored type.
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            keys: Vec::new(),
            cache_type: CacheType::Normal,
            storage_type: StorageType::READ_WRITE_REMOTE,
            capacity: 0,
            period: None,
        }
    }

    pub fn with_keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_cache_type(mut self, cache_type: CacheType) -> Self {
        self.cache_type = cache_type;
        self
    }

    pub fn with_storage_type(mut self, storage_type: StorageType) -> Self {
        self.storage_type = storage_type;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    /// Whether the business key spans more than one field.
    pub fn has_composite_key(&self) -> bool {
        self.keys.len() > 1
    }

    pub fn is_rank(&self) -> bool {
        self.cache_type == CacheType::Rank
    }

    /// Storage hash key of this type.
    pub fn hash_id(&self) -> String {
        storage_key_for(&self.entity_name)
    }

    /// Rejects names that would not survive the key escape round trip.
    pub fn validate(&self) -> Result<()> {
        if self.entity_name.is_empty() {
            return Err(CacheError::InvalidConfig(
                "entity name must not be empty".to_string(),
            ));
        }
        if self.entity_name.contains(ESCAPED_SPLIT_SEQUENCE) {
            return Err(CacheError::InvalidConfig(format!(
                "entity name {} contains the reserved sequence {}",
                self.entity_name, ESCAPED_SPLIT_SEQUENCE
            )));
        }
        if self.entity_name.starts_with(crate::cache::ENTITY_KEY_PRE_CHAR) {
            return Err(CacheError::InvalidConfig(format!(
                "entity name {} starts with the key prefix",
                self.entity_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_type_directions() {
        assert!(StorageType::READ_ONLY_REMOTE.reads_remote());
        assert!(!StorageType::READ_ONLY_REMOTE.writes_remote());
        assert!(StorageType::READ_WRITE_REMOTE.reads_remote());
        assert!(StorageType::READ_WRITE_REMOTE.writes_remote());
        assert!(!StorageType::READ_WRITE_DB.reads_remote());
    }

    #[test]
    fn test_storage_version_ordering() {
        assert!(!StorageVersion::Default.uses_hash_layout());
        assert!(StorageVersion::Hash.uses_hash_layout());
        assert!(!StorageVersion::Hash.maintains_key_index());
        assert!(StorageVersion::HashMultiKeyMap.maintains_key_index());
    }

    #[test]
    fn test_storage_version_serializes_as_number() {
        let json = serde_json::to_string(&StorageVersion::Hash).unwrap();
        assert_eq!(json, "5");
        let back: StorageVersion = serde_json::from_str("7").unwrap();
        assert_eq!(back, StorageVersion::HashMultiKeyMap);
        assert!(serde_json::from_str::<StorageVersion>("6").is_err());
    }

    #[test]
    fn test_schema_builder() {
        let schema = SchemaTable::new("Game.UserItem")
            .with_keys(&["UserId", "ItemId"])
            .with_capacity(100)
            .with_period(Duration::from_secs(60));
        assert!(schema.has_composite_key());
        assert!(!schema.is_rank());
        assert_eq!(schema.hash_id(), "$Game.UserItem");
        assert_eq!(schema.period, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_validate_rejects_reserved_names() {
        assert!(SchemaTable::new("Game.Item").validate().is_ok());
        assert!(SchemaTable::new("Game.Item_V2").validate().is_ok());
        assert!(SchemaTable::new("Game.Item%11").validate().is_err());
        assert!(SchemaTable::new("$Game.Item").validate().is_err());
        assert!(SchemaTable::new("").validate().is_err());
    }
}
