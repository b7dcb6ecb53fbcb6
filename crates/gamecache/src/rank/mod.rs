//! Leaderboard cache.
//!
//! Each leaderboard key is a sorted set (`$TypeName:{key}`) whose members are
//! the encoded rows with their score zeroed, so a row keeps its identity when
//! its score changes. A side hash (`$TypeName:{key}:__order`) records the
//! insertion sequence of every member; reads order by score descending and
//! then by that sequence.

mod cache;
mod item_set;
mod loader;

pub use cache::{board_members, RankCache};
pub use item_set::{CacheItemSet, LoadPolicy, LoadState};
pub use loader::{BackingLoader, LoaderFn};
