use serde::{de::DeserializeOwned, Serialize};

use crate::schema::SchemaTable;

/// A row type that can be cached.
///
/// The capability descriptor returned by [`Entity::schema`] is resolved once
/// per type and passed explicitly through the read and write paths.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Describes how rows of this type are keyed and stored.
    fn schema() -> SchemaTable;

    /// Business key of this row. Composite keys join their fields with
    /// [`KEY_CODE_JOIN_CHAR`](crate::cache::KEY_CODE_JOIN_CHAR).
    fn key_code(&self) -> String;

    /// Whether the row is flagged for removal.
    fn is_deleted(&self) -> bool {
        false
    }

    /// Clears transient mutation flags before the row is stored.
    fn reset(&mut self) {}
}

/// A row that participates in a leaderboard.
pub trait RankEntity: Entity + Clone {
    fn score(&self) -> f64;

    fn set_score(&mut self, score: f64);

    /// Key of the leaderboard this row belongs to.
    fn rank_key(&self) -> String;
}
