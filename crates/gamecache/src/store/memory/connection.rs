use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use gamecache_core::cache::pattern_matches;
use gamecache_core::endpoint::Endpoint;
use gamecache_core::{CacheError, Result};

use super::store::{zset_ascending, MemoryStore};
use crate::store::{StoreConnection, StoreConnector, WriteOp};

/// Connection counters shared by a connector and its connections.
#[derive(Debug, Default)]
struct Counters {
    next_id: AtomicU64,
    connects: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
}

/// Opens [`MemoryConnection`]s against one shared [`MemoryStore`].
///
/// Every endpoint resolves to the same store, so a read-only pool sees the
/// same data as the read/write pool.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    store: MemoryStore,
    counters: Arc<Counters>,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Total connections opened so far.
    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections.
    pub fn peak_open_connections(&self) -> usize {
        self.counters.peak_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self, endpoint: &Endpoint, _db_index: i64) -> Result<MemoryConnection> {
        if !self.store.is_online() {
            return Err(CacheError::ConnectionFault(format!(
                "connection refused: {}",
                endpoint
            )));
        }

        let counters = Arc::clone(&self.counters);
        counters.connects.fetch_add(1, Ordering::SeqCst);
        let open = counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_open.fetch_max(open, Ordering::SeqCst);

        Ok(MemoryConnection {
            id: counters.next_id.fetch_add(1, Ordering::SeqCst),
            store: self.store.clone(),
            watched: Vec::new(),
            faulted: false,
            counters,
        })
    }
}

/// One connection to a [`MemoryStore`], with its own WATCH state.
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    store: MemoryStore,
    watched: Vec<(String, u64)>,
    faulted: bool,
    counters: Arc<Counters>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Marks the connection broken, as a dropped socket would.
    pub fn fault(&mut self) {
        self.faulted = true;
    }

    fn check(&mut self) -> Result<()> {
        if self.faulted {
            return Err(CacheError::ConnectionFault(format!(
                "connection {} is closed",
                self.id
            )));
        }
        if !self.store.is_online() {
            self.faulted = true;
            return Err(CacheError::ConnectionFault(
                "connection reset by peer".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn ping(&mut self) -> Result<()> {
        self.check()
    }

    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        self.store.state.lock().await.string(key)
    }

    async fn mget(&mut self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check()?;
        let mut state = self.store.state.lock().await;
        // MGET yields nil for keys of other types instead of failing.
        Ok(keys
            .iter()
            .map(|key| state.string(key).ok().flatten())
            .collect())
    }

    async fn scan_match(&mut self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let keys = self.store.state.lock().await.keys();
        Ok(keys
            .into_iter()
            .filter(|key| pattern_matches(pattern, key))
            .collect())
    }

    async fn hget(&mut self, key: &str, field: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let mut state = self.store.state.lock().await;
        Ok(state.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    async fn hmget(&mut self, key: &str, fields: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check()?;
        let mut state = self.store.state.lock().await;
        let hash = state.hash(key)?;
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|h| h.get(field).cloned()))
            .collect())
    }

    async fn hget_each(&mut self, reads: &[(String, Vec<u8>)]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check()?;
        let mut state = self.store.state.lock().await;
        let mut values = Vec::with_capacity(reads.len());
        for (key, field) in reads {
            values.push(state.hash(key)?.and_then(|h| h.get(field).cloned()));
        }
        Ok(values)
    }

    async fn hkeys(&mut self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.check()?;
        let mut state = self.store.state.lock().await;
        Ok(state
            .hash(key)?
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hvals(&mut self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.check()?;
        let mut state = self.store.state.lock().await;
        Ok(state
            .hash(key)?
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn smembers(&mut self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.check()?;
        let mut state = self.store.state.lock().await;
        Ok(state
            .set(key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zrevrange_withscores(
        &mut self,
        key: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        self.check()?;
        let mut state = self.store.state.lock().await;
        let mut members = state.zset(key)?.map(zset_ascending).unwrap_or_default();
        members.reverse();
        if let Some(limit) = limit {
            members.truncate(limit);
        }
        Ok(members)
    }

    async fn zrangebyscore(&mut self, key: &str, min: f64, max: f64) -> Result<Vec<Vec<u8>>> {
        self.check()?;
        let mut state = self.store.state.lock().await;
        Ok(state
            .zset(key)?
            .map(zset_ascending)
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zscore(&mut self, key: &str, member: &[u8]) -> Result<Option<f64>> {
        self.check()?;
        let mut state = self.store.state.lock().await;
        Ok(state.zset(key)?.and_then(|z| z.get(member).copied()))
    }

    async fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        self.check()?;
        self.store.state.lock().await.incr_by(key, delta)
    }

    async fn hincr_by(&mut self, key: &str, field: &[u8], delta: i64) -> Result<i64> {
        self.check()?;
        self.store.state.lock().await.hincr_by(key, field, delta)
    }

    async fn pipeline(&mut self, ops: Vec<WriteOp>) -> Result<()> {
        self.check()?;
        let mut state = self.store.state.lock().await;
        // Every command runs; the first failure is reported afterwards.
        let mut first_error = None;
        for op in ops.iter().filter(|op| !op.is_empty()) {
            if let Err(e) = state.apply(op) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn watch(&mut self, keys: &[String]) -> Result<()> {
        self.check()?;
        let mut state = self.store.state.lock().await;
        for key in keys {
            let version = state.version(key);
            self.watched.push((key.clone(), version));
        }
        Ok(())
    }

    async fn unwatch(&mut self) -> Result<()> {
        self.check()?;
        self.watched.clear();
        Ok(())
    }

    async fn exec(&mut self, ops: Vec<WriteOp>) -> Result<bool> {
        self.check()?;
        let watched = std::mem::take(&mut self.watched);
        let mut state = self.store.state.lock().await;
        if watched
            .iter()
            .any(|(key, version)| state.version(key) != *version)
        {
            return Ok(false);
        }
        let mut first_error = None;
        for op in ops.iter().filter(|op| !op.is_empty()) {
            if let Err(e) = state.apply(op) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(true), Err)
    }

    fn is_faulted(&self) -> bool {
        self.faulted
    }

    fn mark_faulted(&mut self) {
        self.faulted = true;
    }
}
