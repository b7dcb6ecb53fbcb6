//! Legacy layout fallbacks.
//!
//! Before the hash layout, rows were stored either one per key
//! (`TypeName_keyCode`) or as one key holding a serialized map of key code to
//! row. Each [`LegacyLayout`] knows how to find and decode its keys. A read
//! that misses the hash tries [`LEGACY_FALLBACKS`] in order and rewrites the
//! first hit into the hash inside one transaction that also deletes the
//! legacy keys.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use gamecache_core::cache::ENTITY_KEY_SPLIT_CHAR;
use gamecache_core::schema::{SchemaTable, StorageVersion};
use gamecache_core::{CacheError, Entity, Result, Serializer};

use super::write::{batch_ops, encode_row};
use crate::context::{discard_on_fault, CacheContext};
use crate::store::{StoreConnection, StoreConnector, WriteOp};
use crate::transaction::{transactional_update, Precondition, TransactionOutcome};

/// Attempts at migrating one layout before reporting a conflict.
const MIGRATION_ATTEMPTS: usize = 3;

/// A storage layout written by older processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyLayout {
    /// Keys named `{redis_key}_{suffix}`. Each holds one serialized row, or a
    /// serialized map when `suffix` is an owner of composite-key rows.
    FlatPerKey,
    /// The redis key itself holds a serialized map of key code to row, or a
    /// single serialized row.
    SerializedMap,
}

/// Fallback order for reads that miss the hash layout.
pub const LEGACY_FALLBACKS: [LegacyLayout; 2] =
    [LegacyLayout::FlatPerKey, LegacyLayout::SerializedMap];

/// Rows found in a legacy layout and the keys holding them.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyRows<T> {
    pub layout: LegacyLayout,
    pub keys: Vec<String>,
    pub rows: Vec<T>,
}

impl LegacyLayout {
    /// Keys this layout would use for `redis_key`.
    pub async fn locate<Conn: StoreConnection>(
        &self,
        conn: &mut Conn,
        redis_key: &str,
    ) -> Result<Vec<String>> {
        match self {
            LegacyLayout::FlatPerKey => {
                conn.scan_match(&format!("{}{}*", redis_key, ENTITY_KEY_SPLIT_CHAR))
                    .await
            }
            LegacyLayout::SerializedMap => Ok(vec![redis_key.to_string()]),
        }
    }

    /// Reads and decodes the rows stored under `keys`. `None` when nothing
    /// is stored there.
    pub async fn read<T: Entity, Conn: StoreConnection>(
        &self,
        conn: &mut Conn,
        keys: &[String],
        serializer: Serializer,
        type_name: &str,
    ) -> Result<Option<Vec<T>>> {
        let rows = match self {
            LegacyLayout::FlatPerKey => {
                if keys.is_empty() {
                    return Ok(None);
                }
                let mut rows = Vec::new();
                for bytes in conn.mget(keys).await?.into_iter().flatten() {
                    rows.extend(decode_map_or_row::<T>(&bytes, serializer, type_name)?);
                }
                rows
            }
            LegacyLayout::SerializedMap => {
                let Some(key) = keys.first() else {
                    return Ok(None);
                };
                match conn.get(key).await? {
                    Some(bytes) => decode_map_or_row(&bytes, serializer, type_name)?,
                    None => return Ok(None),
                }
            }
        };
        Ok((!rows.is_empty()).then_some(rows))
    }

    /// Locates and reads this layout for `redis_key`.
    pub async fn probe<T: Entity, Conn: StoreConnection>(
        &self,
        conn: &mut Conn,
        redis_key: &str,
        serializer: Serializer,
        type_name: &str,
    ) -> Result<Option<LegacyRows<T>>> {
        let keys = self.locate(conn, redis_key).await?;
        let rows = self.read(conn, &keys, serializer, type_name).await?;
        Ok(rows.map(|rows| LegacyRows {
            layout: *self,
            keys,
            rows,
        }))
    }
}

/// Decodes a serialized key code to row map, falling back to one row.
///
/// An empty map only wins when the bytes are not a row either: a binary row
/// whose leading bytes are zero also reads as a zero-length map.
fn decode_map_or_row<T: Entity>(
    bytes: &[u8],
    serializer: Serializer,
    type_name: &str,
) -> Result<Vec<T>> {
    match serializer.deserialize::<BTreeMap<String, T>>(bytes, type_name) {
        Ok(map) if !map.is_empty() => Ok(map.into_values().collect()),
        Ok(_) => Ok(serializer
            .deserialize::<T>(bytes, type_name)
            .map(|row| vec![row])
            .unwrap_or_default()),
        Err(_) => serializer
            .deserialize::<T>(bytes, type_name)
            .map(|row| vec![row]),
    }
}

/// Re-reads a legacy layout after its keys are watched.
struct LegacyRecheck<'a, T> {
    layout: LegacyLayout,
    keys: &'a [String],
    serializer: Serializer,
    type_name: &'a str,
    _rows: PhantomData<fn() -> T>,
}

#[async_trait]
impl<'a, T: Entity, Conn: StoreConnection> Precondition<Conn> for LegacyRecheck<'a, T> {
    type Output = Vec<T>;

    async fn check(&mut self, conn: &mut Conn) -> Result<Option<Vec<T>>> {
        self.layout
            .read(conn, self.keys, self.serializer, self.type_name)
            .await
    }
}

/// Moves one layout's rows for `redis_key` into the hash. `None` when the
/// layout holds nothing.
async fn migrate_layout<T: Entity, Conn: StoreConnection>(
    conn: &mut Conn,
    layout: LegacyLayout,
    redis_key: &str,
    schema: &Arc<SchemaTable>,
    serializer: Serializer,
    version: StorageVersion,
) -> Result<Option<Vec<T>>> {
    for attempt in 1..=MIGRATION_ATTEMPTS {
        let keys = layout.locate(conn, redis_key).await?;
        if keys.is_empty() {
            return Ok(None);
        }

        let mut recheck = LegacyRecheck::<T> {
            layout,
            keys: &keys,
            serializer,
            type_name: &schema.entity_name,
            _rows: PhantomData,
        };
        let outcome = transactional_update(
            conn,
            &keys,
            &mut recheck,
            |rows, tx| {
                let mutations = rows
                    .iter()
                    .map(|row| encode_row(schema, row, serializer))
                    .collect::<Result<Vec<_>>>()?;
                tx.extend(batch_ops(mutations, version));
                tx.push(WriteOp::Del { keys: keys.clone() });
                Ok(())
            },
            None,
        )
        .await?;

        match outcome {
            TransactionOutcome::Applied(rows) => {
                tracing::info!(
                    redis_key,
                    layout = ?layout,
                    rows = rows.len(),
                    legacy_keys = keys.len(),
                    "Migrated legacy rows to hash layout"
                );
                return Ok(Some(rows));
            }
            TransactionOutcome::NotApplicable => return Ok(None),
            TransactionOutcome::Conflict => {
                tracing::debug!(redis_key, attempt, "Legacy migration raced with a writer");
            }
        }
    }

    tracing::warn!(redis_key, layout = ?layout, "Legacy migration kept conflicting");
    Err(CacheError::TransactionConflict(redis_key.to_string()))
}

impl<C: StoreConnector> CacheContext<C> {
    /// Checks the legacy layouts for `redis_key` and migrates the first one
    /// that holds rows. Returns the migrated rows, or nothing.
    pub(crate) async fn read_legacy<T: Entity>(
        &self,
        redis_key: &str,
        schema: &Arc<SchemaTable>,
    ) -> Result<Vec<T>> {
        let serializer = self.serializer();
        let version = self.storage_version();
        let mut conn = self.acquire().await?;

        for layout in LEGACY_FALLBACKS {
            let result =
                migrate_layout::<T, _>(&mut *conn, layout, redis_key, schema, serializer, version)
                    .await;
            if let Some(rows) = discard_on_fault(&mut conn, result)? {
                return Ok(rows);
            }
        }
        Ok(Vec::new())
    }
}
