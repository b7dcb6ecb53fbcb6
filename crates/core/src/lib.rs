//! Pure building blocks for the gamecache entity store.
//!
//! Nothing in this crate performs I/O. It defines how entity types map to
//! storage keys, how rows are encoded to bytes, how pool settings are
//! validated and how the process-wide registration record is reconciled.
//! The `gamecache` crate wires these pieces to real connections.

pub mod cache;
pub mod endpoint;
pub mod registration;
pub mod schema;
pub mod settings;

pub use cache::{CacheError, Entity, RankEntity, Result, Serializer};
