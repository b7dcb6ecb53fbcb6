use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use gamecache_core::cache::{index_set_id, owner_fragment, to_byte_key};
use gamecache_core::schema::{SchemaTable, StorageVersion};
use gamecache_core::{CacheError, Entity, Result, Serializer};

use crate::context::{discard_on_fault, CacheContext};
use crate::store::{StoreConnection, StoreConnector, WriteOp};
use crate::transaction::{transactional_update, Precondition, Transaction, TransactionOutcome};

/// Attempts at raising a counter before reporting a conflict.
const COUNTER_ATTEMPTS: usize = 3;

/// A row write staged for [`CacheContext::apply_batch`].
///
/// Carries the resolved schema of the row's type, so batches may mix types.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMutation {
    schema: Arc<SchemaTable>,
    key_code: String,
    /// Encoded row, or `None` when the row is removed.
    payload: Option<Vec<u8>>,
}

impl EntityMutation {
    pub(crate) fn upsert(schema: Arc<SchemaTable>, key_code: String, payload: Vec<u8>) -> Self {
        Self {
            schema,
            key_code,
            payload: Some(payload),
        }
    }

    pub(crate) fn removal(schema: Arc<SchemaTable>, key_code: String) -> Self {
        Self {
            schema,
            key_code,
            payload: None,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.schema.entity_name
    }

    pub fn key_code(&self) -> &str {
        &self.key_code
    }

    pub fn is_removal(&self) -> bool {
        self.payload.is_none()
    }
}

/// Mutations of one entity type, split into upserts and removals.
#[derive(Debug)]
struct TypeBatch {
    schema: Arc<SchemaTable>,
    upserts: Vec<(String, Vec<u8>)>,
    removals: Vec<String>,
}

impl TypeBatch {
    fn new(schema: Arc<SchemaTable>) -> Self {
        Self {
            schema,
            upserts: Vec::new(),
            removals: Vec::new(),
        }
    }

    /// Hash writes, then index maintenance when the type is indexed.
    fn into_ops(self, hash_id: &str, version: StorageVersion) -> Vec<WriteOp> {
        let indexed = self.schema.has_composite_key() && version.maintains_key_index();
        let mut index_adds: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
        let mut index_removes: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();

        let mut fields = Vec::with_capacity(self.upserts.len());
        for (key_code, payload) in self.upserts {
            if indexed {
                index_adds
                    .entry(owner_fragment(&key_code).to_string())
                    .or_default()
                    .push(to_byte_key(&key_code));
            }
            fields.push((to_byte_key(&key_code), payload));
        }

        let mut removed = Vec::with_capacity(self.removals.len());
        for key_code in self.removals {
            if indexed {
                index_removes
                    .entry(owner_fragment(&key_code).to_string())
                    .or_default()
                    .push(to_byte_key(&key_code));
            }
            removed.push(to_byte_key(&key_code));
        }

        let mut ops = vec![
            WriteOp::HSet {
                key: hash_id.to_string(),
                fields,
            },
            WriteOp::HDel {
                key: hash_id.to_string(),
                fields: removed,
            },
        ];
        ops.extend(index_adds.into_iter().map(|(owner, members)| WriteOp::SAdd {
            key: index_set_id(hash_id, &owner),
            members,
        }));
        ops.extend(index_removes.into_iter().map(|(owner, members)| WriteOp::SRem {
            key: index_set_id(hash_id, &owner),
            members,
        }));
        ops.retain(|op| !op.is_empty());
        ops
    }
}

/// Groups mutations by storage hash, dropping types that do not write to
/// the remote store.
fn group_by_type(mutations: Vec<EntityMutation>) -> BTreeMap<String, TypeBatch> {
    let mut groups: BTreeMap<String, TypeBatch> = BTreeMap::new();
    for mutation in mutations {
        if !mutation.schema.storage_type.writes_remote() {
            tracing::trace!(
                entity = %mutation.schema.entity_name,
                "Skipping write of local-only type"
            );
            continue;
        }
        let batch = groups
            .entry(mutation.schema.hash_id())
            .or_insert_with(|| TypeBatch::new(Arc::clone(&mutation.schema)));
        match mutation.payload {
            Some(payload) => batch.upserts.push((mutation.key_code, payload)),
            None => batch.removals.push(mutation.key_code),
        }
    }
    groups
}

/// Encodes a row without touching its flags.
pub(crate) fn encode_row<T: Entity>(
    schema: &Arc<SchemaTable>,
    row: &T,
    serializer: Serializer,
) -> Result<EntityMutation> {
    if row.is_deleted() {
        return Ok(EntityMutation::removal(Arc::clone(schema), row.key_code()));
    }
    Ok(EntityMutation::upsert(
        Arc::clone(schema),
        row.key_code(),
        serializer.serialize(row)?,
    ))
}

/// Staged hash writes for `mutations`, grouped by type.
pub(crate) fn batch_ops(mutations: Vec<EntityMutation>, version: StorageVersion) -> Vec<WriteOp> {
    group_by_type(mutations)
        .into_iter()
        .flat_map(|(hash_id, batch)| batch.into_ops(&hash_id, version))
        .collect()
}

impl<C: StoreConnector> CacheContext<C> {
    /// Stages one row. Rows flagged deleted become removals; the others have
    /// their mutation flags cleared and are encoded.
    pub fn stage<T: Entity>(&self, row: &mut T) -> Result<EntityMutation> {
        let schema = self.schema::<T>()?;
        if !row.is_deleted() {
            row.reset();
        }
        encode_row(&schema, row, self.serializer())
    }

    /// Writes rows of one type. See [`apply_batch`](Self::apply_batch).
    pub async fn update_entities<T: Entity>(&self, rows: &mut [T]) -> Result<()> {
        let mutations = rows
            .iter_mut()
            .map(|row| self.stage(row))
            .collect::<Result<Vec<_>>>()?;
        self.apply_batch(mutations).await
    }

    /// Writes a batch with one pipeline per entity type.
    ///
    /// The batch is not atomic. Every type is attempted; the first failure
    /// is returned and the caller retries the batch.
    pub async fn apply_batch(&self, mutations: Vec<EntityMutation>) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let version = self.storage_version();
        let groups = group_by_type(mutations);
        if groups.is_empty() {
            return Ok(());
        }

        let mut conn = self.acquire().await?;
        let mut first_error = None;
        for (hash_id, batch) in groups {
            let ops = batch.into_ops(&hash_id, version);
            let count = ops.len();
            let result = conn.pipeline(ops).await;
            if let Err(e) = discard_on_fault(&mut conn, result) {
                tracing::warn!(hash_id = %hash_id, error = %e, "Batch write failed");
                first_error.get_or_insert(e);
            } else {
                tracing::trace!(hash_id = %hash_id, commands = count, "Batch written");
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Queues the hash writes for `mutations` into a caller's transaction.
    pub fn trans_update_entities(&self, tx: &mut Transaction, mutations: Vec<EntityMutation>) {
        tx.extend(batch_ops(mutations, self.storage_version()));
    }

    /// Atomically adds `increment` to a counter and returns the new value.
    pub async fn next_number(&self, key: &str, increment: i64) -> Result<i64> {
        let mut conn = self.acquire().await?;
        let result = conn.incr_by(key, increment).await;
        discard_on_fault(&mut conn, result)
    }

    /// Raises a counter to `value` unless it is already at least that high.
    /// Returns the counter afterwards.
    pub async fn ensure_number_at_least(&self, key: &str, value: i64) -> Result<i64> {
        let mut conn = self.acquire().await?;
        let watch = [key.to_string()];
        for _ in 0..COUNTER_ATTEMPTS {
            let mut check = CounterBelow {
                key,
                target: value,
                observed: 0,
            };
            let outcome = transactional_update(
                &mut *conn,
                &watch,
                &mut check,
                |_, tx| {
                    tx.push(WriteOp::Set {
                        key: key.to_string(),
                        value: value.to_string().into_bytes(),
                    });
                    Ok(())
                },
                None,
            )
            .await;

            match discard_on_fault(&mut conn, outcome)? {
                TransactionOutcome::Applied(()) => return Ok(value),
                TransactionOutcome::NotApplicable => return Ok(check.observed),
                TransactionOutcome::Conflict => continue,
            }
        }
        Err(CacheError::TransactionConflict(key.to_string()))
    }

    /// Stores each value under its key with a time to live. Zero seconds
    /// deletes the keys instead.
    pub async fn set_expire(&self, keys: &[String], values: &[Vec<u8>], seconds: u64) -> Result<()> {
        if keys.len() != values.len() {
            return Err(CacheError::OperationFailed(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )));
        }
        if keys.is_empty() {
            return Ok(());
        }

        let ops = if seconds == 0 {
            vec![WriteOp::Del {
                keys: keys.to_vec(),
            }]
        } else {
            keys.iter()
                .zip(values)
                .map(|(key, value)| WriteOp::SetEx {
                    key: key.clone(),
                    value: value.clone(),
                    seconds,
                })
                .collect()
        };

        let mut conn = self.acquire().await?;
        let result = conn.pipeline(ops).await;
        discard_on_fault(&mut conn, result)
    }
}

/// Applies while the counter is below `target`, remembering what it read.
struct CounterBelow<'a> {
    key: &'a str,
    target: i64,
    observed: i64,
}

#[async_trait]
impl<'a, Conn: StoreConnection> Precondition<Conn> for CounterBelow<'a> {
    type Output = ();

    async fn check(&mut self, conn: &mut Conn) -> Result<Option<()>> {
        self.observed = match conn.get(self.key).await? {
            Some(bytes) => String::from_utf8_lossy(&bytes).trim().parse().map_err(|_| {
                CacheError::CorruptRecord {
                    type_name: self.key.to_string(),
                    reason: "counter is not an integer".to_string(),
                }
            })?,
            None => 0,
        };
        Ok((self.observed < self.target).then_some(()))
    }
}
