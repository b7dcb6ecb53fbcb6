//! Endpoint to pool mapping.
//!
//! Pools are keyed by the normalized `host:port` of their endpoint and are
//! created lazily on first use. Exactly one pool exists per key even when
//! many callers race on first use.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use gamecache_core::endpoint::Endpoint;
use gamecache_core::settings::PoolSettings;
use gamecache_core::Result;

use super::object_pool::{ObjectPool, ObjectPoolConfig, PoolFactory, PoolStats, Pooled};
use crate::store::{StoreConnection, StoreConnector};

/// Opens store connections for one endpoint.
pub struct ConnectionFactory<C: StoreConnector> {
    connector: Arc<C>,
    endpoint: Endpoint,
    db_index: i64,
}

#[async_trait]
impl<C: StoreConnector> PoolFactory for ConnectionFactory<C> {
    type Object = C::Connection;

    async fn create(&self) -> Result<C::Connection> {
        self.connector.connect(&self.endpoint, self.db_index).await
    }

    fn is_reusable(&self, connection: &C::Connection) -> bool {
        !connection.is_faulted()
    }
}

pub type ConnectionPool<C> = ObjectPool<ConnectionFactory<C>>;

/// A leased store connection. Released or disposed when dropped.
pub type PooledConnection<C> = Pooled<ConnectionFactory<C>>;

/// Owns every connection pool of the process.
pub struct ConnectionPoolManager<C: StoreConnector> {
    connector: Arc<C>,
    settings: PoolSettings,
    pools: RwLock<HashMap<String, ConnectionPool<C>>>,
}

impl<C: StoreConnector> ConnectionPoolManager<C> {
    pub fn new(connector: C, settings: PoolSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            connector: Arc::new(connector),
            settings,
            pools: RwLock::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Returns the pool for the endpoint named by `settings`, creating it on
    /// first use.
    pub fn get_or_add_pool(&self, settings: &PoolSettings) -> Result<ConnectionPool<C>> {
        let endpoint = settings.endpoint()?;
        let key = endpoint.pool_key();

        if let Some(pool) = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have won the race between the two locks.
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }

        let config = ObjectPoolConfig {
            name: key.clone(),
            max_size: settings.max_pool_size,
            idle_timeout: settings.idle_timeout,
            acquire_timeout: settings.acquire_timeout,
        };
        let factory = ConnectionFactory {
            connector: Arc::clone(&self.connector),
            endpoint,
            db_index: settings.db_index,
        };
        let pool = ObjectPool::new(config, factory)?;
        pools.insert(key.clone(), pool.clone());

        tracing::debug!(
            endpoint = %key,
            max_size = settings.max_pool_size,
            "Connection pool created"
        );
        Ok(pool)
    }

    /// The read/write pool.
    pub fn pool(&self) -> Result<ConnectionPool<C>> {
        self.get_or_add_pool(&self.settings)
    }

    /// The read-only pool, or the read/write pool when no replica is set.
    pub fn read_only_pool(&self) -> Result<ConnectionPool<C>> {
        match self.settings.read_only() {
            Some(settings) => self.get_or_add_pool(&settings),
            None => self.pool(),
        }
    }

    pub async fn acquire(&self) -> Result<PooledConnection<C>> {
        self.pool()?.acquire().await
    }

    pub async fn acquire_read_only(&self) -> Result<PooledConnection<C>> {
        self.read_only_pool()?.acquire().await
    }

    /// Runs `f` with a leased read/write connection.
    ///
    /// The connection goes back to its pool afterwards, unless `f` failed
    /// with a connection fault, in which case it is disposed.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut C::Connection) -> BoxFuture<'c, Result<T>>,
    {
        let conn = self.acquire().await?;
        run_leased(conn, f).await
    }

    /// Like [`with_connection`](Self::with_connection) on the read-only pool.
    pub async fn with_read_only_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut C::Connection) -> BoxFuture<'c, Result<T>>,
    {
        let conn = self.acquire_read_only().await?;
        run_leased(conn, f).await
    }

    /// Pings the read/write and read-only endpoints. Never fails.
    pub async fn check_connectivity(&self) -> bool {
        let mut healthy = true;
        let pools = [self.pool(), self.read_only_pool()];
        for pool in pools {
            let outcome = match pool {
                Ok(pool) => match pool.acquire().await {
                    Ok(mut conn) => conn.ping().await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                tracing::error!(error = %e, "Connectivity check failed");
                healthy = false;
            }
        }
        healthy
    }

    /// Creates `settings.min_pool_size` idle connections per pool.
    pub async fn prewarm(&self) -> Result<()> {
        let count = self.settings.min_pool_size;
        let idle = self.pool()?.prewarm(count).await?;
        if self.settings.read_only_host.is_some() {
            self.read_only_pool()?.prewarm(count).await?;
        }
        tracing::debug!(idle, "Connection pools prewarmed");
        Ok(())
    }

    pub fn pool_count(&self) -> usize {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(ObjectPool::stats)
            .collect();
        stats.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }

    /// Closes every pool. Leased connections are disposed when released.
    pub fn shutdown(&self) {
        let pools: Vec<ConnectionPool<C>> = self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        for pool in &pools {
            pool.close();
        }
        tracing::info!(pools = pools.len(), "Connection pools shut down");
    }
}

async fn run_leased<C, T, F>(mut conn: PooledConnection<C>, f: F) -> Result<T>
where
    C: StoreConnector,
    F: for<'c> FnOnce(&'c mut C::Connection) -> BoxFuture<'c, Result<T>>,
{
    let result = f(&mut *conn).await;
    if let Err(e) = &result {
        if e.is_connection_fault() {
            tracing::warn!(error = %e, "Discarding connection after fault");
            conn.discard();
        }
    }
    result
}
