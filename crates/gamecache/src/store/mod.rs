//! Store connections.
//!
//! The engine talks to the key-value store through [`StoreConnection`], a
//! narrow command set covering exactly what the entity and rank caches need.
//! Two backends implement it:
//!
//! - `redis` (default feature): a dedicated Redis connection per pooled slot
//! - `memory`: an in-process store mirroring Redis semantics, used by tests
//!   and by the CLI when no server is configured
//!
//! Writes are described as [`WriteOp`] values so the same batch can be sent
//! as a plain pipeline or inside a MULTI/EXEC transaction.

use async_trait::async_trait;

use gamecache_core::endpoint::Endpoint;
use gamecache_core::Result;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis_impl;

pub use memory::{MemoryConnection, MemoryConnector, MemoryStore};

#[cfg(feature = "redis")]
pub use redis_impl::{RedisConnection, RedisConnector};

/// A queued write command.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set {
        key: String,
        value: Vec<u8>,
    },
    SetEx {
        key: String,
        value: Vec<u8>,
        seconds: u64,
    },
    Del {
        keys: Vec<String>,
    },
    HSet {
        key: String,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
    },
    HSetNx {
        key: String,
        field: Vec<u8>,
        value: Vec<u8>,
    },
    HDel {
        key: String,
        fields: Vec<Vec<u8>>,
    },
    SAdd {
        key: String,
        members: Vec<Vec<u8>>,
    },
    SRem {
        key: String,
        members: Vec<Vec<u8>>,
    },
    ZAdd {
        key: String,
        members: Vec<(f64, Vec<u8>)>,
    },
    ZRem {
        key: String,
        members: Vec<Vec<u8>>,
    },
    ZRemRangeByScore {
        key: String,
        min: f64,
        max: f64,
    },
}

impl WriteOp {
    /// Whether the command would be rejected for carrying no arguments.
    pub(crate) fn is_empty(&self) -> bool {
        match self {
            WriteOp::Del { keys } => keys.is_empty(),
            WriteOp::HSet { fields, .. } => fields.is_empty(),
            WriteOp::HDel { fields, .. } => fields.is_empty(),
            WriteOp::SAdd { members, .. } | WriteOp::SRem { members, .. } => members.is_empty(),
            WriteOp::ZAdd { members, .. } => members.is_empty(),
            WriteOp::ZRem { members, .. } => members.is_empty(),
            _ => false,
        }
    }
}

/// One leased connection to the store.
///
/// Implementations mark themselves faulted when a transport error occurs so
/// the pool disposes them instead of handing them out again.
#[async_trait]
pub trait StoreConnection: Send + 'static {
    async fn ping(&mut self) -> Result<()>;

    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn mget(&mut self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Returns every key matching a glob pattern.
    async fn scan_match(&mut self, pattern: &str) -> Result<Vec<String>>;

    async fn hget(&mut self, key: &str, field: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn hmget(&mut self, key: &str, fields: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>>;

    /// One `HGET` per `(key, field)` pair, sent in a single round trip.
    async fn hget_each(&mut self, reads: &[(String, Vec<u8>)]) -> Result<Vec<Option<Vec<u8>>>>;

    async fn hkeys(&mut self, key: &str) -> Result<Vec<Vec<u8>>>;

    async fn hvals(&mut self, key: &str) -> Result<Vec<Vec<u8>>>;

    async fn smembers(&mut self, key: &str) -> Result<Vec<Vec<u8>>>;

    /// Members by descending score with their scores, limited to `limit`
    /// entries when set.
    async fn zrevrange_withscores(
        &mut self,
        key: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, f64)>>;

    /// Members whose score lies in `[min, max]`, ascending.
    async fn zrangebyscore(&mut self, key: &str, min: f64, max: f64) -> Result<Vec<Vec<u8>>>;

    async fn zscore(&mut self, key: &str, member: &[u8]) -> Result<Option<f64>>;

    async fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64>;

    async fn hincr_by(&mut self, key: &str, field: &[u8], delta: i64) -> Result<i64>;

    /// Sends the writes as one pipeline. Not atomic.
    async fn pipeline(&mut self, ops: Vec<WriteOp>) -> Result<()>;

    async fn watch(&mut self, keys: &[String]) -> Result<()>;

    async fn unwatch(&mut self) -> Result<()>;

    /// Runs the writes in MULTI/EXEC. Returns `false` when a watched key
    /// changed and nothing was applied.
    async fn exec(&mut self, ops: Vec<WriteOp>) -> Result<bool>;

    /// Whether a transport error has made this connection unusable.
    fn is_faulted(&self) -> bool;

    /// Marks the connection unusable so its pool disposes it on release.
    fn mark_faulted(&mut self);
}

/// Opens connections to one endpoint.
#[async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    type Connection: StoreConnection;

    async fn connect(&self, endpoint: &Endpoint, db_index: i64) -> Result<Self::Connection>;
}
