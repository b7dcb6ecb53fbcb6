use std::collections::BTreeMap;

use gamecache_core::cache::{
    contains_key_fragment, entity_redis_key, from_byte_key, index_set_id, owner_fragment,
    split_redis_key, to_byte_key,
};
use gamecache_core::schema::{SchemaTable, StorageVersion};
use gamecache_core::{CacheError, Entity, Result};

use crate::context::{discard_on_fault, CacheContext};
use crate::store::{StoreConnection, StoreConnector, WriteOp};

/// Raw payloads fetched from a type's hash.
#[derive(Debug, Default)]
struct CanonicalRead {
    payloads: Vec<Vec<u8>>,
    /// Composite key fields found by scanning that are missing from the
    /// index.
    unindexed: Vec<Vec<u8>>,
}

/// Reads payloads for `keys` (or the whole hash) from the canonical layout.
async fn read_canonical<Conn: StoreConnection>(
    conn: &mut Conn,
    schema: &SchemaTable,
    hash_id: &str,
    keys: Option<&[String]>,
    version: StorageVersion,
) -> Result<CanonicalRead> {
    let Some(keys) = keys else {
        return Ok(CanonicalRead {
            payloads: conn.hvals(hash_id).await?,
            ..Default::default()
        });
    };
    if keys.is_empty() {
        return Ok(CanonicalRead::default());
    }

    if schema.has_composite_key() {
        return read_composite(conn, hash_id, keys, version).await;
    }

    let payloads = match keys {
        [key] => conn.hget(hash_id, &to_byte_key(key)).await?.into_iter().collect(),
        _ => {
            let fields: Vec<Vec<u8>> = keys.iter().map(|k| to_byte_key(k)).collect();
            conn.hmget(hash_id, &fields).await?.into_iter().flatten().collect()
        }
    };
    Ok(CanonicalRead {
        payloads,
        ..Default::default()
    })
}

/// Reads the rows owned by `owners` for a composite-key type.
///
/// The index sets are used when the storage version maintains them. An
/// empty index falls back to scanning every field of the hash; fields found
/// that way are reported so the index can be filled in.
async fn read_composite<Conn: StoreConnection>(
    conn: &mut Conn,
    hash_id: &str,
    owners: &[String],
    version: StorageVersion,
) -> Result<CanonicalRead> {
    if version.maintains_key_index() {
        let mut fields = Vec::new();
        for owner in owners {
            fields.extend(conn.smembers(&index_set_id(hash_id, owner)).await?);
        }
        if !fields.is_empty() {
            let payloads = conn.hmget(hash_id, &fields).await?;
            return Ok(CanonicalRead {
                payloads: payloads.into_iter().flatten().collect(),
                ..Default::default()
            });
        }
    }

    let fragments: Vec<Vec<u8>> = owners.iter().map(|o| to_byte_key(o)).collect();
    let fields: Vec<Vec<u8>> = conn
        .hkeys(hash_id)
        .await?
        .into_iter()
        .filter(|field| contains_key_fragment(field, &fragments))
        .collect();
    if fields.is_empty() {
        return Ok(CanonicalRead::default());
    }

    let payloads = conn.hmget(hash_id, &fields).await?;
    Ok(CanonicalRead {
        payloads: payloads.into_iter().flatten().collect(),
        unindexed: if version.maintains_key_index() {
            fields
        } else {
            Vec::new()
        },
    })
}

/// SADD commands indexing `fields` under their owning key.
fn index_ops(hash_id: &str, fields: &[Vec<u8>]) -> Vec<WriteOp> {
    let mut by_owner: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
    for field in fields {
        let Ok(key_code) = from_byte_key(field) else {
            continue;
        };
        by_owner
            .entry(owner_fragment(&key_code).to_string())
            .or_default()
            .push(field.clone());
    }
    by_owner
        .into_iter()
        .map(|(owner, members)| WriteOp::SAdd {
            key: index_set_id(hash_id, &owner),
            members,
        })
        .collect()
}

impl<C: StoreConnector> CacheContext<C> {
    /// Reads the rows addressed by a redis key (`TypeName` or
    /// `TypeName_businessKey`, type part escaped).
    ///
    /// Data still stored in a legacy layout is migrated on the way. Finding
    /// nothing is an empty result.
    pub async fn try_get_entities<T: Entity>(&self, redis_key: &str) -> Result<Vec<T>> {
        let schema = self.schema::<T>()?;
        if schema.is_rank() {
            return Err(CacheError::InvalidConfig(format!(
                "{} is a rank type; read it through the rank cache",
                schema.entity_name
            )));
        }
        if !schema.storage_type.reads_remote() {
            return Ok(Vec::new());
        }

        let version = self.storage_version();
        let (hash_id, business_key) = split_redis_key(redis_key);
        let keys = business_key.map(|key| vec![key]);

        if !version.uses_hash_layout() {
            let rows = self.read_legacy::<T>(redis_key, &schema).await?;
            if !rows.is_empty() {
                return Ok(rows);
            }
        }

        let rows = self
            .read_hash::<T>(&schema, &hash_id, keys.as_deref(), version)
            .await?;
        if !rows.is_empty() || !version.uses_hash_layout() {
            return Ok(rows);
        }

        self.read_legacy::<T>(redis_key, &schema).await
    }

    /// Reads the rows of `T` under one business key, or every row when
    /// `business_key` is `None`.
    pub async fn get_entities<T: Entity>(&self, business_key: Option<&str>) -> Result<Vec<T>> {
        let schema = self.schema::<T>()?;
        let redis_key = entity_redis_key(&schema.entity_name, business_key);
        self.try_get_entities::<T>(&redis_key).await
    }

    /// Reads the rows of `T` stored under any of `ids` in one round trip.
    ///
    /// For composite-key types each id names an owning key. Legacy layouts
    /// are not consulted.
    pub async fn get_all_entities<T: Entity>(&self, ids: &[String]) -> Result<Vec<T>> {
        let schema = self.schema::<T>()?;
        if ids.is_empty() || !schema.storage_type.reads_remote() {
            return Ok(Vec::new());
        }
        let version = self.storage_version();
        self.read_hash::<T>(&schema, &schema.hash_id(), Some(ids), version)
            .await
    }

    /// Reads the row stored under `business_key` in each of `hash_ids`, one
    /// `HGET` per hash in a single round trip. Missing and empty values are
    /// `None`; the result follows the order of `hash_ids`.
    pub async fn get_across_types(
        &self,
        business_key: &str,
        hash_ids: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let field = to_byte_key(business_key);
        let reads: Vec<(String, Vec<u8>)> = hash_ids
            .iter()
            .map(|hash_id| (hash_id.clone(), field.clone()))
            .collect();

        let mut conn = self.acquire_read_only().await?;
        let result = conn.hget_each(&reads).await;
        let values = discard_on_fault(&mut conn, result)?;
        Ok(values
            .into_iter()
            .map(|value| value.filter(|bytes| !bytes.is_empty()))
            .collect())
    }

    /// Reads one business key of two entity types in one round trip. A type
    /// without remote reads comes back as `None`.
    pub async fn get_entity_pair<A: Entity, B: Entity>(
        &self,
        business_key: &str,
    ) -> Result<(Option<A>, Option<B>)> {
        let first = self.schema::<A>()?;
        let second = self.schema::<B>()?;
        let hash_ids = [first.hash_id(), second.hash_id()];
        let mut values = self.get_across_types(business_key, &hash_ids).await?.into_iter();

        let serializer = self.serializer();
        let a = match values.next().flatten() {
            Some(bytes) if first.storage_type.reads_remote() => {
                Some(serializer.deserialize(&bytes, &first.entity_name)?)
            }
            _ => None,
        };
        let b = match values.next().flatten() {
            Some(bytes) if second.storage_type.reads_remote() => {
                Some(serializer.deserialize(&bytes, &second.entity_name)?)
            }
            _ => None,
        };
        Ok((a, b))
    }

    async fn read_hash<T: Entity>(
        &self,
        schema: &SchemaTable,
        hash_id: &str,
        keys: Option<&[String]>,
        version: StorageVersion,
    ) -> Result<Vec<T>> {
        let read = {
            let mut conn = self.acquire_read_only().await?;
            let result = read_canonical(&mut *conn, schema, hash_id, keys, version).await;
            discard_on_fault(&mut conn, result)?
        };

        if !read.unindexed.is_empty() {
            self.backfill_index(hash_id, &read.unindexed).await;
        }

        let serializer = self.serializer();
        read.payloads
            .iter()
            .map(|payload| serializer.deserialize(payload, &schema.entity_name))
            .collect()
    }

    /// Adds scanned composite keys to their index sets. Failures are logged;
    /// the next read scans again.
    async fn backfill_index(&self, hash_id: &str, fields: &[Vec<u8>]) {
        let ops = index_ops(hash_id, fields);
        let result = match self.acquire().await {
            Ok(mut conn) => {
                let result = conn.pipeline(ops).await;
                discard_on_fault(&mut conn, result)
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::debug!(hash_id, fields = fields.len(), "Key index backfilled"),
            Err(e) => tracing::warn!(hash_id, error = %e, "Key index backfill failed"),
        }
    }
}
