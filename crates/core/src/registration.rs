//! Process-wide registration record.
//!
//! One well-known key holds a JSON document naming the server instance that
//! owns the store, the codec it writes with and the storage format version.
//! Every process reconciles its own identity against that record at init.
//! Reconciliation is pure; the caller reads and writes the record under a
//! watch so concurrent inits cannot both claim an empty record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheError, Result, Serializer};
use crate::schema::StorageVersion;

/// Well-known key of the registration record.
pub const REGISTRATION_KEY: &str = "__RedisInfo";

/// Stored registration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    #[serde(default)]
    pub hash_code: String,
    #[serde(default)]
    pub server_host: String,
    #[serde(default)]
    pub server_path: String,
    #[serde(default)]
    pub serializer_type: String,
    #[serde(default = "default_version")]
    pub client_version: StorageVersion,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub named_secondaries: BTreeMap<String, RegistrationRecord>,
}

fn default_version() -> StorageVersion {
    StorageVersion::Default
}

impl RegistrationRecord {
    /// Parses a stored document.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::CorruptRecord {
            type_name: REGISTRATION_KEY.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    /// Whether no primary has claimed the store yet.
    pub fn is_unclaimed(&self) -> bool {
        self.hash_code.is_empty()
    }

    /// Whether the primary writes with a different codec than `serializer`.
    pub fn serializer_mismatch(&self, serializer: Serializer) -> bool {
        !self.serializer_type.is_empty() && self.serializer_type != serializer.name()
    }

    fn stamp(&mut self, local: &LocalIdentity, now: DateTime<Utc>) {
        self.serializer_type = local.serializer.name().to_string();
        self.client_version = local.version;
        self.start_time = Some(now);
    }

    fn claim(&mut self, local: &LocalIdentity, now: DateTime<Utc>) {
        self.hash_code = local.hash_code();
        self.server_host = local.host.clone();
        self.server_path = local.path.clone();
        self.stamp(local, now);
    }
}

/// Identity of the local process.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalIdentity {
    /// Host name of the machine.
    pub host: String,
    /// Install path of the running server.
    pub path: String,
    pub serializer: Serializer,
    pub version: StorageVersion,
    /// Set when this process joins as a declared secondary.
    pub secondary_name: Option<String>,
}

impl LocalIdentity {
    /// MD5 hex digest of host and install path.
    pub fn hash_code(&self) -> String {
        format!("{:x}", md5::compute(format!("{}{}", self.host, self.path)))
    }
}

/// Reconciles the stored record with the local identity.
///
/// Returns the record to write back, or [`CacheError::RegistrationConflict`]
/// when another instance owns the store (or the named secondary slot).
pub fn reconcile(
    existing: Option<RegistrationRecord>,
    local: &LocalIdentity,
    now: DateTime<Utc>,
) -> Result<RegistrationRecord> {
    let mut record = existing.unwrap_or_default();
    let hash_code = local.hash_code();

    match local.secondary_name.as_deref().filter(|n| !n.is_empty()) {
        None if record.is_unclaimed() => record.claim(local, now),
        None if record.hash_code == hash_code => record.stamp(local, now),
        None => {
            return Err(CacheError::RegistrationConflict(format!(
                "the store is owned by a server at host \"{}\" path {}",
                record.server_host, record.server_path
            )));
        }
        Some(name) => match record.named_secondaries.get_mut(name) {
            None => {
                let mut secondary = RegistrationRecord::default();
                secondary.claim(local, now);
                record.named_secondaries.insert(name.to_string(), secondary);
            }
            Some(secondary) if secondary.hash_code == hash_code => secondary.stamp(local, now),
            Some(secondary) => {
                return Err(CacheError::RegistrationConflict(format!(
                    "secondary [{}] is owned by a server at host \"{}\" path {}",
                    name, secondary.server_host, secondary.server_path
                )));
            }
        },
    }

    Ok(record)
}
