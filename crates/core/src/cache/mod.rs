mod error;
mod keys;
mod patterns;
mod serialization;
mod traits;

pub use error::{CacheError, Result};
pub use keys::{
    decode_type_name, encode_type_name, entity_redis_key, from_byte_key, index_set_id,
    rank_order_key, rank_set_id, root_key, split_redis_key, storage_key_for, to_byte_key,
    ENTITY_KEY_PRE_CHAR, ENTITY_KEY_SPLIT_CHAR, ESCAPED_SPLIT_SEQUENCE, KEY_CODE_JOIN_CHAR,
};
pub use patterns::{contains_key_fragment, owner_fragment, pattern_matches};
pub use serialization::Serializer;
pub use traits::{Entity, RankEntity};
