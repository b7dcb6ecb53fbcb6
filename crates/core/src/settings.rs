//! Endpoint and pool tuning, validated before any pool is built.

use std::time::Duration;

use crate::cache::{CacheError, Result};
use crate::endpoint::Endpoint;
use crate::schema::StorageVersion;

/// Endpoint plus pool tuning for one store.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    /// Read/write address in `[password@]host[:port]` form.
    pub host: String,
    /// Optional read-only replica address in the same form.
    pub read_only_host: Option<String>,
    pub db_index: i64,
    /// Idle connections created at startup.
    pub min_pool_size: usize,
    /// Upper bound of live connections per endpoint.
    pub max_pool_size: usize,
    /// Idle connections older than this are discarded on acquire.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// How long an acquire waits for a free slot before failing.
    pub acquire_timeout: Duration,
    pub storage_version: StorageVersion,
}

impl PoolSettings {
    /// Creates settings for `host` with default tuning.
    pub fn new(host: impl Into<String>) -> Result<Self> {
        let settings = Self {
            host: host.into(),
            read_only_host: None,
            db_index: 0,
            min_pool_size: 2,
            max_pool_size: 32,
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_millis(2_000),
            acquire_timeout: Duration::from_millis(5_000),
            storage_version: StorageVersion::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_read_only_host(mut self, host: impl Into<String>) -> Self {
        self.read_only_host = Some(host.into());
        self
    }

    pub fn with_db_index(mut self, db_index: i64) -> Self {
        self.db_index = db_index;
        self
    }

    pub fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.min_pool_size = min;
        self.max_pool_size = max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_storage_version(mut self, version: StorageVersion) -> Self {
        self.storage_version = version;
        self
    }

    /// Checks the tuning and both addresses.
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(CacheError::InvalidConfig(
                "max pool size must be greater than zero".to_string(),
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(CacheError::InvalidConfig(format!(
                "min pool size {} exceeds max pool size {}",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.connect_timeout.is_zero()
            || self.acquire_timeout.is_zero()
            || self.idle_timeout.is_zero()
        {
            return Err(CacheError::InvalidConfig(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.db_index < 0 {
            return Err(CacheError::InvalidConfig(format!(
                "db index must not be negative: {}",
                self.db_index
            )));
        }
        Endpoint::parse(&self.host)?;
        if let Some(host) = &self.read_only_host {
            Endpoint::parse(host)?;
        }
        Ok(())
    }

    /// Parsed read/write endpoint.
    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.host)
    }

    /// Settings for the read-only endpoint, when one is configured.
    pub fn read_only(&self) -> Option<PoolSettings> {
        self.read_only_host.as_ref().map(|host| PoolSettings {
            host: host.clone(),
            read_only_host: None,
            ..self.clone()
        })
    }
}
