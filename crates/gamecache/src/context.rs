//! Process-wide cache context.
//!
//! [`CacheContext`] owns everything the engine shares across callers: the
//! connection pools, the active codec, the schema registry and the
//! registration record negotiated at init. Create one per process, call
//! [`CacheContext::initialize`] before use and [`CacheContext::shutdown`] on
//! exit.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use gamecache_core::registration::{
    reconcile, LocalIdentity, RegistrationRecord, REGISTRATION_KEY,
};
use gamecache_core::schema::{SchemaRegistry, SchemaTable, StorageVersion};
use gamecache_core::settings::PoolSettings;
use gamecache_core::{CacheError, Entity, Result, Serializer};

use crate::pool::{ConnectionPoolManager, PooledConnection};
use crate::store::{StoreConnection, StoreConnector, WriteOp};
use crate::transaction::{transactional_update, Precondition, TransactionOutcome};

/// Attempts at claiming the registration record before giving up.
const REGISTRATION_ATTEMPTS: usize = 3;

/// Shared state of the cache engine.
pub struct CacheContext<C: StoreConnector> {
    manager: ConnectionPoolManager<C>,
    serializer: Serializer,
    schemas: SchemaRegistry,
    identity: LocalIdentity,
    registration: RwLock<Option<RegistrationRecord>>,
}

impl<C: StoreConnector> CacheContext<C> {
    /// Creates a context identified by this machine's host name and the
    /// directory of the running executable.
    pub fn new(connector: C, settings: PoolSettings) -> Result<Self> {
        let identity = LocalIdentity {
            host: gethostname::gethostname().to_string_lossy().into_owned(),
            path: install_path(),
            serializer: Serializer::default(),
            version: settings.storage_version,
            secondary_name: None,
        };
        Ok(Self {
            manager: ConnectionPoolManager::new(connector, settings)?,
            serializer: Serializer::default(),
            schemas: SchemaRegistry::new(),
            identity,
            registration: RwLock::new(None),
        })
    }

    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self.identity.serializer = serializer;
        self
    }

    /// Joins the store as the named secondary instead of its primary.
    pub fn with_secondary_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.identity.secondary_name = (!name.is_empty()).then_some(name);
        self
    }

    /// Overrides the host and install path recorded at registration.
    pub fn with_server_identity(
        mut self,
        host: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        self.identity.host = host.into();
        self.identity.path = path.into();
        self
    }

    /// Prewarms the pools and registers this process with the store.
    ///
    /// A [`CacheError::RegistrationConflict`] means another server instance
    /// owns the store and the process must not continue.
    pub async fn initialize(&self) -> Result<RegistrationRecord> {
        self.manager.prewarm().await?;

        let mut conn = self.manager.acquire().await?;
        let watch = [REGISTRATION_KEY.to_string()];
        let on_error = |e: &CacheError| {
            if matches!(e, CacheError::RegistrationConflict(_)) {
                tracing::error!(error = %e, "Cache registration rejected");
            }
        };

        for attempt in 1..=REGISTRATION_ATTEMPTS {
            let mut check = RegistrationCheck {
                identity: &self.identity,
                now: Utc::now(),
            };
            let outcome = transactional_update(
                &mut *conn,
                &watch,
                &mut check,
                |record, tx| {
                    tx.push(WriteOp::Set {
                        key: REGISTRATION_KEY.to_string(),
                        value: record.to_json()?,
                    });
                    Ok(())
                },
                Some(&on_error),
            )
            .await;

            match discard_on_fault(&mut conn, outcome)? {
                TransactionOutcome::Applied(record) => {
                    tracing::info!(
                        host = %self.identity.host,
                        path = %self.identity.path,
                        secondary = ?self.identity.secondary_name,
                        version = ?record.client_version,
                        serializer = %self.serializer,
                        "Cache registered"
                    );
                    *self
                        .registration
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
                    return Ok(record);
                }
                TransactionOutcome::Conflict | TransactionOutcome::NotApplicable => {
                    tracing::debug!(attempt, "Registration raced with another process");
                }
            }
        }

        Err(CacheError::TransactionConflict(REGISTRATION_KEY.to_string()))
    }

    /// Closes every pool.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    pub fn manager(&self) -> &ConnectionPoolManager<C> {
        &self.manager
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// The record written at init, if [`initialize`](Self::initialize) ran.
    pub fn registration(&self) -> Option<RegistrationRecord> {
        self.registration
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Storage format in effect: the registered version, or the configured
    /// one before registration.
    pub fn storage_version(&self) -> StorageVersion {
        self.registration
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|record| record.client_version)
            .unwrap_or(self.identity.version)
    }

    pub fn schema<T: Entity>(&self) -> Result<Arc<SchemaTable>> {
        self.schemas.resolve::<T>()
    }

    pub(crate) async fn acquire(&self) -> Result<PooledConnection<C>> {
        self.manager.acquire().await
    }

    pub(crate) async fn acquire_read_only(&self) -> Result<PooledConnection<C>> {
        self.manager.acquire_read_only().await
    }
}

/// Reads the stored record and reconciles it with the local identity.
struct RegistrationCheck<'a> {
    identity: &'a LocalIdentity,
    now: DateTime<Utc>,
}

#[async_trait]
impl<'a, Conn: StoreConnection> Precondition<Conn> for RegistrationCheck<'a> {
    type Output = RegistrationRecord;

    async fn check(&mut self, conn: &mut Conn) -> Result<Option<RegistrationRecord>> {
        let existing = match conn.get(REGISTRATION_KEY).await? {
            Some(bytes) => Some(RegistrationRecord::from_json(&bytes)?),
            None => None,
        };

        if let Some(record) = &existing {
            if record.serializer_mismatch(self.identity.serializer) {
                tracing::warn!(
                    stored = %record.serializer_type,
                    local = %self.identity.serializer,
                    "Cache serializer differs from the registered one"
                );
            }
        }

        reconcile(existing, self.identity, self.now).map(Some)
    }
}

/// Marks the leased connection for disposal when `result` is a transport
/// fault, then passes the result through.
pub(crate) fn discard_on_fault<C: StoreConnector, T>(
    conn: &mut PooledConnection<C>,
    result: Result<T>,
) -> Result<T> {
    if let Err(e) = &result {
        if e.is_connection_fault() {
            tracing::warn!(error = %e, "Discarding connection after fault");
            conn.discard();
        }
    }
    result
}

fn install_path() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.display().to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConnector, MemoryStore};

    fn context(store: &MemoryStore, host: &str) -> CacheContext<MemoryConnector> {
        let settings = PoolSettings::new("cache.local:6379")
            .unwrap()
            .with_pool_size(1, 4);
        CacheContext::new(MemoryConnector::new(store.clone()), settings)
            .unwrap()
            .with_server_identity(host, "/srv/game")
    }

    async fn stored_record(store: &MemoryStore) -> RegistrationRecord {
        let connector = MemoryConnector::new(store.clone());
        let mut conn = connector
            .connect(&"memory".parse().unwrap(), 0)
            .await
            .unwrap();
        let bytes = conn.get(REGISTRATION_KEY).await.unwrap().unwrap();
        RegistrationRecord::from_json(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_claims_empty_store() {
        let store = MemoryStore::new();
        let ctx = context(&store, "game-01").with_serializer(Serializer::Json);

        let record = ctx.initialize().await.unwrap();

        assert_eq!(record.server_host, "game-01");
        assert_eq!(record.serializer_type, "Json");
        assert_eq!(record.client_version, StorageVersion::HashMultiKeyMap);
        assert_eq!(stored_record(&store).await, record);
        assert_eq!(ctx.registration(), Some(record));
    }

    #[tokio::test]
    async fn test_reinitialize_same_identity_succeeds() {
        let store = MemoryStore::new();
        context(&store, "game-01").initialize().await.unwrap();
        let again = context(&store, "game-01").initialize().await.unwrap();
        assert_eq!(again.server_host, "game-01");
    }

    #[tokio::test]
    async fn test_foreign_primary_is_rejected() {
        let store = MemoryStore::new();
        context(&store, "game-01").initialize().await.unwrap();

        let err = context(&store, "game-02").initialize().await.unwrap_err();
        assert!(matches!(err, CacheError::RegistrationConflict(_)));
        assert_eq!(stored_record(&store).await.server_host, "game-01");
    }

    #[tokio::test]
    async fn test_named_secondary_joins_owned_store() {
        let store = MemoryStore::new();
        context(&store, "game-01").initialize().await.unwrap();

        let record = context(&store, "game-02")
            .with_secondary_name("battle")
            .initialize()
            .await
            .unwrap();

        assert_eq!(record.server_host, "game-01");
        assert_eq!(record.named_secondaries["battle"].server_host, "game-02");
    }

    #[tokio::test]
    async fn test_storage_version_follows_registration() {
        let store = MemoryStore::new();
        let settings = PoolSettings::new("cache.local")
            .unwrap()
            .with_storage_version(StorageVersion::Hash);
        let legacy = CacheContext::new(MemoryConnector::new(store.clone()), settings)
            .unwrap()
            .with_server_identity("game-01", "/srv/game");
        legacy.initialize().await.unwrap();

        let secondary = context(&store, "game-02").with_secondary_name("tools");
        assert_eq!(secondary.storage_version(), StorageVersion::HashMultiKeyMap);
        secondary.initialize().await.unwrap();
        assert_eq!(secondary.storage_version(), StorageVersion::Hash);
    }

    #[tokio::test]
    async fn test_initialize_fails_when_store_is_down() {
        let store = MemoryStore::new();
        store.set_online(false);
        let err = context(&store, "game-01").initialize().await.unwrap_err();
        assert!(err.is_connection_fault());
    }
}
