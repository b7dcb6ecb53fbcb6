use std::{env, time::Duration};

use gamecache_core::cache::Serializer;
use gamecache_core::schema::StorageVersion;
use gamecache_core::settings::PoolSettings;
use gamecache_core::Result;

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Read/write endpoint in `[password@]host[:port]` form (default: "localhost:6379")
    pub host: String,
    /// Optional read-only replica endpoint
    pub read_host: Option<String>,
    pub db: i64,
    pub pool_min: usize,
    pub pool_max: usize,
    pub idle_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    /// Storage format written by this process (default: 7)
    pub storage_version: u32,
    /// Codec name, `binary` or `json` (default: "binary")
    pub serializer: String,
    /// Name under which this process joins as a secondary
    pub secondary_name: Option<String>,
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `GAMECACHE_HOST` - Read/write endpoint (default: "localhost:6379")
    /// - `GAMECACHE_READ_HOST` - Read-only endpoint (default: none)
    /// - `GAMECACHE_DB` - Database index (default: 0)
    /// - `GAMECACHE_POOL_MIN` / `GAMECACHE_POOL_MAX` - Pool bounds (default: 2 / 32)
    /// - `GAMECACHE_IDLE_TIMEOUT_SECS` - Idle connection lifetime (default: 300)
    /// - `GAMECACHE_CONNECT_TIMEOUT_MS` - Connect timeout (default: 2000)
    /// - `GAMECACHE_ACQUIRE_TIMEOUT_MS` - Pool acquire timeout (default: 5000)
    /// - `GAMECACHE_STORAGE_VERSION` - Storage format, 0, 5 or 7 (default: 7)
    /// - `GAMECACHE_SERIALIZER` - `binary` or `json` (default: "binary")
    /// - `GAMECACHE_SECONDARY_NAME` - Named secondary identity (default: none)
    ///
    /// Unparseable numbers fall back to their defaults.
    pub fn from_env() -> Self {
        Self {
            host: env::var("GAMECACHE_HOST").unwrap_or_else(|_| "localhost:6379".to_string()),
            read_host: non_empty_var("GAMECACHE_READ_HOST"),
            db: var_or("GAMECACHE_DB", 0),
            pool_min: var_or("GAMECACHE_POOL_MIN", 2),
            pool_max: var_or("GAMECACHE_POOL_MAX", 32),
            idle_timeout_secs: var_or("GAMECACHE_IDLE_TIMEOUT_SECS", 300),
            connect_timeout_ms: var_or("GAMECACHE_CONNECT_TIMEOUT_MS", 2_000),
            acquire_timeout_ms: var_or("GAMECACHE_ACQUIRE_TIMEOUT_MS", 5_000),
            storage_version: var_or(
                "GAMECACHE_STORAGE_VERSION",
                StorageVersion::HashMultiKeyMap as u32,
            ),
            serializer: env::var("GAMECACHE_SERIALIZER").unwrap_or_else(|_| "binary".to_string()),
            secondary_name: non_empty_var("GAMECACHE_SECONDARY_NAME"),
        }
    }

    /// Validated pool settings.
    pub fn to_settings(&self) -> Result<PoolSettings> {
        let mut settings = PoolSettings::new(self.host.clone())?
            .with_db_index(self.db)
            .with_pool_size(self.pool_min, self.pool_max)
            .with_idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_acquire_timeout(Duration::from_millis(self.acquire_timeout_ms))
            .with_storage_version(StorageVersion::try_from(self.storage_version)?);
        if let Some(read_host) = &self.read_host {
            settings = settings.with_read_only_host(read_host.clone());
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn serializer(&self) -> Result<Serializer> {
        self.serializer.parse()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
