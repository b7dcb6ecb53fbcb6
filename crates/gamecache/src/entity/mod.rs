//! Entity cache: canonical hash reads, batch writes and legacy migration.
//!
//! Every row of an entity type lives in one hash (`$TypeName`) keyed by its
//! business key. Types with composite keys may also keep an index set per
//! owning key so a single owner's rows can be fetched without scanning the
//! hash. Data written by older processes in per-key layouts is moved into the
//! hash the first time it is read.
//!
//! All operations are methods on [`CacheContext`](crate::context::CacheContext).

mod migration;
mod read;
mod write;

pub use migration::{LegacyLayout, LegacyRows, LEGACY_FALLBACKS};
pub use write::EntityMutation;

#[cfg(test)]
pub(crate) mod fixtures {
    use serde::{Deserialize, Serialize};

    use gamecache_core::schema::{SchemaTable, StorageType, StorageVersion};
    use gamecache_core::settings::PoolSettings;
    use gamecache_core::Entity;

    use crate::context::CacheContext;
    use crate::store::{MemoryConnection, MemoryConnector, MemoryStore, StoreConnector};

    /// A player-owned row with a composite `(user_id, item_id)` key.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct UserItem {
        pub user_id: u32,
        pub item_id: u32,
        pub count: i64,
        #[serde(skip)]
        pub deleted: bool,
        #[serde(skip)]
        pub dirty: bool,
    }

    impl UserItem {
        pub fn new(user_id: u32, item_id: u32, count: i64) -> Self {
            Self {
                user_id,
                item_id,
                count,
                deleted: false,
                dirty: true,
            }
        }
    }

    impl Entity for UserItem {
        fn schema() -> SchemaTable {
            SchemaTable::new("Game.UserItem").with_keys(&["UserId", "ItemId"])
        }

        fn key_code(&self) -> String {
            format!("{}-{}", self.user_id, self.item_id)
        }

        fn is_deleted(&self) -> bool {
            self.deleted
        }

        fn reset(&mut self) {
            self.dirty = false;
        }
    }

    /// A shared configuration row keyed by a single field.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct GuildInfo {
        pub guild_id: u32,
        pub name: String,
    }

    impl Entity for GuildInfo {
        fn schema() -> SchemaTable {
            SchemaTable::new("Game.GuildInfo").with_keys(&["GuildId"])
        }

        fn key_code(&self) -> String {
            self.guild_id.to_string()
        }
    }

    /// A row that is only ever read from the local database.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LocalOnly {
        pub id: u32,
    }

    impl Entity for LocalOnly {
        fn schema() -> SchemaTable {
            SchemaTable::new("Game.LocalOnly")
                .with_keys(&["Id"])
                .with_storage_type(StorageType::READ_WRITE_DB)
        }

        fn key_code(&self) -> String {
            self.id.to_string()
        }
    }

    pub fn context(store: &MemoryStore, version: StorageVersion) -> CacheContext<MemoryConnector> {
        let settings = PoolSettings::new("cache.local:6379")
            .unwrap()
            .with_pool_size(1, 4)
            .with_storage_version(version);
        CacheContext::new(MemoryConnector::new(store.clone()), settings).unwrap()
    }

    /// A raw connection for arranging and inspecting store contents.
    pub async fn raw(store: &MemoryStore) -> MemoryConnection {
        MemoryConnector::new(store.clone())
            .connect(&"memory".parse().unwrap(), 0)
            .await
            .unwrap()
    }
}
