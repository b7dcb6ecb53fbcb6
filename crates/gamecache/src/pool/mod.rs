//! Connection pooling.
//!
//! [`ObjectPool`] is a generic bounded pool with idle expiry;
//! [`ConnectionPoolManager`] maps endpoints to pools of store connections.

mod manager;
mod object_pool;

pub use manager::{ConnectionFactory, ConnectionPool, ConnectionPoolManager, PooledConnection};
pub use object_pool::{ObjectPool, ObjectPoolConfig, PoolFactory, PoolStats, Pooled};
