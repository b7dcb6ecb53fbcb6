//! Redis store backend.
//!
//! Each pooled slot owns one multiplexed Redis connection. Connections are
//! never shared between callers while leased, so WATCH state stays private
//! to the caller holding the lease.

mod connection;
mod error;

pub use connection::{RedisConnection, RedisConnector};
pub use error::map_redis_error;
