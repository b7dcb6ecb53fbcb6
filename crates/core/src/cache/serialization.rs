//! Pluggable byte codecs for cached rows.
//!
//! Two codecs are available: a compact binary format (bincode) and JSON. The
//! codec is chosen once at process init; its [`Serializer::name`] is recorded in
//! the registration record so cooperating processes can detect a mismatch.

use std::fmt;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{CacheError, Result};

/// The active row codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Serializer {
    /// Compact binary encoding.
    #[default]
    Binary,
    /// Human-readable JSON encoding.
    Json,
}

impl Serializer {
    /// Name recorded in the registration record.
    pub fn name(&self) -> &'static str {
        match self {
            Serializer::Binary => "Binary",
            Serializer::Json => "Json",
        }
    }

    /// Serializes a value to bytes.
    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Serializer::Binary => {
                bincode::serialize(value).map_err(|e| CacheError::Serialization(e.to_string()))
            }
            Serializer::Json => {
                serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))
            }
        }
    }

    /// Deserializes bytes produced by [`Serializer::serialize`].
    ///
    /// Any failure is reported as [`CacheError::CorruptRecord`] tagged with
    /// `type_name`; callers decide whether that is fatal.
    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8], type_name: &str) -> Result<T> {
        let result = match self {
            Serializer::Binary => bincode::deserialize(bytes).map_err(|e| e.to_string()),
            Serializer::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        };
        result.map_err(|reason| CacheError::CorruptRecord {
            type_name: type_name.to_string(),
            reason,
        })
    }
}

impl fmt::Display for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Serializer {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "bincode" => Ok(Serializer::Binary),
            "json" => Ok(Serializer::Json),
            other => Err(CacheError::InvalidConfig(format!(
                "unknown serializer: {}",
                other
            ))),
        }
    }
}
