//! Deterministic mapping from entity types and business keys to storage keys.
//!
//! A storage key is built from the escaped type name prefixed with
//! [`ENTITY_KEY_PRE_CHAR`]. Inside a redis key the type and the business key
//! are separated by [`ENTITY_KEY_SPLIT_CHAR`], so every occurrence of the
//! separator in a type name is replaced by [`ESCAPED_SPLIT_SEQUENCE`] before it
//! reaches the store. The escape is wire-compatible with data already written
//! by other processes and must stay bit-exact.

use super::{CacheError, Result};

/// Sentinel prefix of every entity hash key.
pub const ENTITY_KEY_PRE_CHAR: &str = "$";

/// Separator between the type part and the business key part of a redis key.
pub const ENTITY_KEY_SPLIT_CHAR: &str = "_";

/// Replacement for [`ENTITY_KEY_SPLIT_CHAR`] inside type names.
pub const ESCAPED_SPLIT_SEQUENCE: &str = "%11";

/// Separator between the fields of a composite business key.
pub const KEY_CODE_JOIN_CHAR: char = '-';

/// Escapes a type name so it can be used as the type part of a redis key.
pub fn encode_type_name(type_name: &str) -> String {
    type_name.replace(ENTITY_KEY_SPLIT_CHAR, ESCAPED_SPLIT_SEQUENCE)
}

/// Reverses [`encode_type_name`], also accepting a prefixed storage key.
///
/// # Examples
///
/// ```
/// use gamecache_core::cache::{decode_type_name, encode_type_name};
///
/// let encoded = encode_type_name("Game.Model_V2");
/// assert_eq!(encoded, "Game.Model%11V2");
/// assert_eq!(decode_type_name(&encoded), "Game.Model_V2");
/// assert_eq!(decode_type_name("$Game.Model%11V2"), "Game.Model_V2");
/// ```
pub fn decode_type_name(key: &str) -> String {
    key.trim_start_matches(ENTITY_KEY_PRE_CHAR)
        .replace(ESCAPED_SPLIT_SEQUENCE, ENTITY_KEY_SPLIT_CHAR)
}

/// Returns the part of a redis key before the first separator.
pub fn root_key(redis_key: &str) -> &str {
    redis_key
        .split(ENTITY_KEY_SPLIT_CHAR)
        .next()
        .unwrap_or(redis_key)
}

/// Returns the hash key that stores every row of the given entity type.
///
/// # Examples
///
/// ```
/// use gamecache_core::cache::storage_key_for;
///
/// assert_eq!(storage_key_for("Game.UserItem"), "$Game.UserItem");
/// assert_eq!(storage_key_for("Game.User_Item"), "$Game.User%11Item");
/// ```
pub fn storage_key_for(type_name: &str) -> String {
    hash_id_of(&encode_type_name(type_name))
}

/// Builds the redis key used to request rows of a type, optionally narrowed
/// to one business key.
pub fn entity_redis_key(type_name: &str, business_key: Option<&str>) -> String {
    let encoded = encode_type_name(type_name);
    match business_key {
        Some(key) => format!("{}{}{}", encoded, ENTITY_KEY_SPLIT_CHAR, key),
        None => encoded,
    }
}

/// Splits a redis key into its storage hash key and optional business key.
///
/// The type part is expected to be escaped already. Everything after the
/// first separator belongs to the business key.
///
/// # Examples
///
/// ```
/// use gamecache_core::cache::split_redis_key;
///
/// assert_eq!(
///     split_redis_key("Game.UserItem_1001"),
///     ("$Game.UserItem".to_string(), Some("1001".to_string()))
/// );
/// assert_eq!(split_redis_key("Game.Config"), ("$Game.Config".to_string(), None));
/// ```
pub fn split_redis_key(redis_key: &str) -> (String, Option<String>) {
    match redis_key.split_once(ENTITY_KEY_SPLIT_CHAR) {
        Some((root, rest)) if !rest.is_empty() => (hash_id_of(root), Some(rest.to_string())),
        Some((root, _)) => (hash_id_of(root), None),
        None => (hash_id_of(redis_key), None),
    }
}

fn hash_id_of(root: &str) -> String {
    if root.starts_with(ENTITY_KEY_PRE_CHAR) {
        root.to_string()
    } else {
        format!("{}{}", ENTITY_KEY_PRE_CHAR, root)
    }
}

/// Returns the sorted-set key of one leaderboard.
pub fn rank_set_id(hash_id: &str, key: &str) -> String {
    format!("{}:{}", hash_id, key)
}

/// Returns the hash that records insertion order for a leaderboard.
pub fn rank_order_key(set_id: &str) -> String {
    format!("{}:__order", set_id)
}

/// Returns the set that indexes composite key codes under their owning key.
pub fn index_set_id(hash_id: &str, owner_key: &str) -> String {
    format!("{}:{}", hash_id, owner_key)
}

/// Converts key material to bytes. Always UTF-8.
pub fn to_byte_key(key: &str) -> Vec<u8> {
    key.as_bytes().to_vec()
}

/// Converts stored key bytes back to text.
pub fn from_byte_key(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| CacheError::Serialization(format!("key is not valid UTF-8: {}", e)))
}
