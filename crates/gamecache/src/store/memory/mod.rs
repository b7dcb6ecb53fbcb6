//! In-memory store backend.
//!
//! Mirrors the Redis behavior the engine relies on (typed values, WATCH
//! versioning, sorted-set ordering, glob key scans) so the whole engine can be
//! exercised without a server.

mod connection;
mod store;

pub use connection::{MemoryConnection, MemoryConnector};
pub use store::MemoryStore;
