//! Redis-backed entity and leaderboard cache for game servers.
//!
//! A process builds one [`CacheContext`] from [`PoolSettings`](gamecache_core::settings::PoolSettings),
//! initializes it against the store's registration record and then reads and
//! writes entity rows through it. Leaderboards live in [`RankCache`], one per
//! rank entity type.

pub mod config;
pub mod context;
pub mod entity;
pub mod pool;
pub mod rank;
pub mod store;
pub mod transaction;

pub use context::CacheContext;
pub use entity::EntityMutation;
pub use rank::{BackingLoader, LoadPolicy, LoaderFn, RankCache};
