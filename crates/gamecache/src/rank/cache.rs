use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use gamecache_core::cache::{rank_order_key, rank_set_id, RankEntity};
use gamecache_core::schema::SchemaTable;
use gamecache_core::{CacheError, Result};

use super::item_set::{CacheItemSet, LoadGuard, LoadPolicy, LoadState};
use super::loader::BackingLoader;
use crate::context::{discard_on_fault, CacheContext};
use crate::store::{StoreConnection, StoreConnector, WriteOp};
use crate::transaction::{transactional_update, Precondition, TransactionOutcome};

/// Field of the order hash holding the last issued sequence number.
const ORDER_COUNTER_FIELD: &[u8] = b"";

const EXCHANGE_ATTEMPTS: usize = 3;

/// A stored member with its score and insertion sequence.
#[derive(Debug, Clone, PartialEq)]
struct Ranked {
    member: Vec<u8>,
    score: f64,
    seq: i64,
}

fn parse_seq(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

/// Every member of a board in read order.
async fn ranked_members<Conn: StoreConnection>(
    conn: &mut Conn,
    set_id: &str,
) -> Result<Vec<Ranked>> {
    let entries = conn.zrevrange_withscores(set_id, None).await?;
    if entries.is_empty() {
        return Ok(Vec::new());
    }
    let fields: Vec<Vec<u8>> = entries.iter().map(|(member, _)| member.clone()).collect();
    let seqs = conn.hmget(&rank_order_key(set_id), &fields).await?;

    let mut ranked: Vec<Ranked> = entries
        .into_iter()
        .zip(seqs)
        .map(|((member, score), seq)| Ranked {
            member,
            score,
            seq: seq.as_deref().and_then(parse_seq).unwrap_or(i64::MAX),
        })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.seq.cmp(&b.seq)));
    Ok(ranked)
}

/// Raw members of the board stored at `set_id` with their scores, in read
/// order.
pub async fn board_members<Conn: StoreConnection>(
    conn: &mut Conn,
    set_id: &str,
) -> Result<Vec<(Vec<u8>, f64)>> {
    let ranked = ranked_members(conn, set_id).await?;
    Ok(ranked.into_iter().map(|r| (r.member, r.score)).collect())
}

/// Issues sequence numbers for `members` and returns the commands adding
/// them. Members already on the board keep their sequence.
async fn stage_adds<Conn: StoreConnection>(
    conn: &mut Conn,
    set_id: &str,
    members: Vec<(f64, Vec<u8>)>,
) -> Result<Vec<WriteOp>> {
    if members.is_empty() {
        return Ok(Vec::new());
    }
    let order_key = rank_order_key(set_id);
    let count = members.len() as i64;
    let last = conn.hincr_by(&order_key, ORDER_COUNTER_FIELD, count).await?;
    let first = last - count + 1;

    let mut ops: Vec<WriteOp> = members
        .iter()
        .zip(first..)
        .map(|((_, member), seq)| WriteOp::HSetNx {
            key: order_key.clone(),
            field: member.clone(),
            value: seq.to_string().into_bytes(),
        })
        .collect();
    ops.push(WriteOp::ZAdd {
        key: set_id.to_string(),
        members,
    });
    Ok(ops)
}

fn removal_ops(set_id: &str, members: Vec<Vec<u8>>) -> Vec<WriteOp> {
    vec![
        WriteOp::ZRem {
            key: set_id.to_string(),
            members: members.clone(),
        },
        WriteOp::HDel {
            key: rank_order_key(set_id),
            fields: members,
        },
    ]
}

/// Drops the members past `capacity` in read order. Zero means unbounded.
async fn trim<Conn: StoreConnection>(
    conn: &mut Conn,
    set_id: &str,
    capacity: usize,
) -> Result<usize> {
    if capacity == 0 {
        return Ok(0);
    }
    let ranked = ranked_members(conn, set_id).await?;
    if ranked.len() <= capacity {
        return Ok(0);
    }
    let evicted: Vec<Vec<u8>> = ranked
        .into_iter()
        .skip(capacity)
        .map(|r| r.member)
        .collect();
    let count = evicted.len();
    conn.pipeline(removal_ops(set_id, evicted)).await?;
    tracing::debug!(set_id, evicted = count, "Leaderboard trimmed to capacity");
    Ok(count)
}

async fn write_members<Conn: StoreConnection>(
    conn: &mut Conn,
    set_id: &str,
    adds: Vec<(f64, Vec<u8>)>,
    removes: Vec<Vec<u8>>,
    capacity: usize,
) -> Result<()> {
    let mut ops = stage_adds(conn, set_id, adds).await?;
    if !removes.is_empty() {
        ops.extend(removal_ops(set_id, removes));
    }
    conn.pipeline(ops).await?;
    trim(conn, set_id, capacity).await?;
    Ok(())
}

/// Replaces a board's contents atomically.
async fn replace_board<Conn: StoreConnection>(
    conn: &mut Conn,
    set_id: &str,
    members: Vec<(f64, Vec<u8>)>,
    capacity: usize,
) -> Result<()> {
    let order_key = rank_order_key(set_id);
    let count = members.len() as i64;
    let last = conn.hincr_by(&order_key, ORDER_COUNTER_FIELD, count).await?;
    let first = last - count + 1;

    let mut order = vec![(ORDER_COUNTER_FIELD.to_vec(), last.to_string().into_bytes())];
    order.extend(
        members
            .iter()
            .zip(first..)
            .map(|((_, member), seq)| (member.clone(), seq.to_string().into_bytes())),
    );
    let ops = vec![
        WriteOp::Del {
            keys: vec![set_id.to_string(), order_key.clone()],
        },
        WriteOp::HSet {
            key: order_key,
            fields: order,
        },
        WriteOp::ZAdd {
            key: set_id.to_string(),
            members,
        },
    ];
    if !conn.exec(ops).await? {
        return Err(CacheError::TransactionConflict(set_id.to_string()));
    }
    trim(conn, set_id, capacity).await?;
    Ok(())
}

fn read_limit(count: i64, capacity: usize) -> Option<usize> {
    let ceiling = (capacity > 0).then_some(capacity);
    if count < 0 {
        return ceiling;
    }
    let count = usize::try_from(count).unwrap_or(usize::MAX);
    Some(ceiling.map_or(count, |ceiling| ceiling.min(count)))
}

/// Reads both members' stored scores. Not applicable when either is off the
/// board.
struct StoredScores<'a> {
    set_id: &'a str,
    a: &'a [u8],
    b: &'a [u8],
}

#[async_trait]
impl<'a, Conn: StoreConnection> Precondition<Conn> for StoredScores<'a> {
    type Output = (f64, f64);

    async fn check(&mut self, conn: &mut Conn) -> Result<Option<(f64, f64)>> {
        let a = conn.zscore(self.set_id, self.a).await?;
        let b = conn.zscore(self.set_id, self.b).await?;
        Ok(a.zip(b))
    }
}

/// Members scoring inside a band. Not applicable when the band is empty.
struct ScoreBand<'a> {
    set_id: &'a str,
    from: f64,
    to: f64,
}

#[async_trait]
impl<'a, Conn: StoreConnection> Precondition<Conn> for ScoreBand<'a> {
    type Output = Vec<Vec<u8>>;

    async fn check(&mut self, conn: &mut Conn) -> Result<Option<Vec<Vec<u8>>>> {
        let members = conn.zrangebyscore(self.set_id, self.from, self.to).await?;
        Ok((!members.is_empty()).then_some(members))
    }
}

/// Leaderboards of one rank entity type.
pub struct RankCache<T: RankEntity, C: StoreConnector> {
    context: Arc<CacheContext<C>>,
    schema: Arc<SchemaTable>,
    policy: LoadPolicy,
    sets: RwLock<HashMap<String, Arc<CacheItemSet>>>,
    _rows: PhantomData<fn() -> T>,
}

impl<T: RankEntity, C: StoreConnector> RankCache<T, C> {
    pub fn new(context: Arc<CacheContext<C>>) -> Result<Self> {
        let schema = context.schema::<T>()?;
        if !schema.is_rank() {
            return Err(CacheError::InvalidConfig(format!(
                "{} is not a rank type",
                schema.entity_name
            )));
        }
        Ok(Self {
            context,
            schema,
            policy: LoadPolicy::default(),
            sets: RwLock::new(HashMap::new()),
            _rows: PhantomData,
        })
    }

    pub fn with_policy(mut self, policy: LoadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn schema(&self) -> &SchemaTable {
        &self.schema
    }

    /// Sorted set key of the board `key`.
    pub fn set_id(&self, key: &str) -> String {
        rank_set_id(&self.schema.hash_id(), key)
    }

    /// Stable member bytes of a row: its encoding with flags cleared and the
    /// score zeroed.
    fn member_of(&self, item: &T) -> Result<Vec<u8>> {
        let mut identity = item.clone();
        identity.reset();
        identity.set_score(0.0);
        self.context.serializer().serialize(&identity)
    }

    fn scored_members<'a>(
        &self,
        items: impl IntoIterator<Item = &'a T>,
    ) -> Result<Vec<(f64, Vec<u8>)>> {
        items
            .into_iter()
            .map(|item| Ok((item.score(), self.member_of(item)?)))
            .collect()
    }

    /// Adds rows to a board in the given order. Ties keep that order.
    pub async fn add_range(&self, key: &str, items: &[T]) -> Result<()> {
        if items.is_empty() || !self.schema.storage_type.writes_remote() {
            return Ok(());
        }
        let members = self.scored_members(items)?;
        let set_id = self.set_id(key);

        let mut conn = self.context.acquire().await?;
        let result =
            write_members(&mut *conn, &set_id, members, Vec::new(), self.schema.capacity).await;
        discard_on_fault(&mut conn, result)
    }

    /// Writes score changes: live rows are added or re-scored, rows flagged
    /// deleted leave the board.
    pub async fn update_ranks(&self, key: &str, items: &[T]) -> Result<()> {
        if items.is_empty() || !self.schema.storage_type.writes_remote() {
            return Ok(());
        }
        let (removed, live): (Vec<&T>, Vec<&T>) = items.iter().partition(|i| i.is_deleted());
        let adds = self.scored_members(live)?;
        let removes = removed
            .into_iter()
            .map(|item| self.member_of(item))
            .collect::<Result<Vec<_>>>()?;
        let set_id = self.set_id(key);

        let mut conn = self.context.acquire().await?;
        let result = write_members(&mut *conn, &set_id, adds, removes, self.schema.capacity).await;
        discard_on_fault(&mut conn, result)
    }

    /// Rows of a board by descending score. `count < 0` reads everything up
    /// to the schema capacity.
    pub async fn take_range(&self, key: &str, count: i64) -> Result<Vec<T>> {
        if !self.schema.storage_type.reads_remote() {
            return Ok(Vec::new());
        }
        let set_id = self.set_id(key);
        let mut ranked = {
            let mut conn = self.context.acquire_read_only().await?;
            let result = ranked_members(&mut *conn, &set_id).await;
            discard_on_fault(&mut conn, result)?
        };
        if let Some(limit) = read_limit(count, self.schema.capacity) {
            ranked.truncate(limit);
        }

        let serializer = self.context.serializer();
        ranked
            .into_iter()
            .map(|r| {
                let mut item: T = serializer.deserialize(&r.member, &self.schema.entity_name)?;
                item.set_score(r.score);
                Ok(item)
            })
            .collect()
    }

    /// Swaps the stored scores of two rows in one transaction. Returns
    /// `false` when either row is not on the board.
    pub async fn exchange_score(&self, key: &str, a: &T, b: &T) -> Result<bool> {
        let member_a = self.member_of(a)?;
        let member_b = self.member_of(b)?;
        let set_id = self.set_id(key);
        let watch = [set_id.clone()];

        let mut conn = self.context.acquire().await?;
        for attempt in 1..=EXCHANGE_ATTEMPTS {
            let mut check = StoredScores {
                set_id: &set_id,
                a: &member_a,
                b: &member_b,
            };
            let outcome = transactional_update(
                &mut *conn,
                &watch,
                &mut check,
                |&(score_a, score_b), tx| {
                    tx.push(WriteOp::ZAdd {
                        key: set_id.clone(),
                        members: vec![(score_b, member_a.clone()), (score_a, member_b.clone())],
                    });
                    Ok(())
                },
                None,
            )
            .await;

            match discard_on_fault(&mut conn, outcome)? {
                TransactionOutcome::Applied(_) => return Ok(true),
                TransactionOutcome::NotApplicable => return Ok(false),
                TransactionOutcome::Conflict => {
                    tracing::debug!(set_id = %set_id, attempt, "Score exchange conflicted");
                }
            }
        }
        Err(CacheError::TransactionConflict(set_id))
    }

    /// Removes every row scoring within `[from, to]`. Returns how many
    /// were removed.
    pub async fn remove_by_score_range(&self, key: &str, from: f64, to: f64) -> Result<usize> {
        let set_id = self.set_id(key);
        let watch = [set_id.clone()];

        let mut conn = self.context.acquire().await?;
        for attempt in 1..=EXCHANGE_ATTEMPTS {
            let mut band = ScoreBand {
                set_id: &set_id,
                from,
                to,
            };
            let outcome = transactional_update(
                &mut *conn,
                &watch,
                &mut band,
                |members, tx| {
                    tx.push(WriteOp::ZRemRangeByScore {
                        key: set_id.clone(),
                        min: from,
                        max: to,
                    });
                    tx.push(WriteOp::HDel {
                        key: rank_order_key(&set_id),
                        fields: members.clone(),
                    });
                    Ok(())
                },
                None,
            )
            .await;

            match discard_on_fault(&mut conn, outcome)? {
                TransactionOutcome::Applied(members) => return Ok(members.len()),
                TransactionOutcome::NotApplicable => return Ok(0),
                TransactionOutcome::Conflict => {
                    tracing::debug!(set_id = %set_id, attempt, "Score band removal conflicted");
                }
            }
        }
        Err(CacheError::TransactionConflict(set_id))
    }

    /// Load state of a board key.
    pub fn load_state(&self, key: &str) -> LoadState {
        self.sets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|set| set.state())
            .unwrap_or(LoadState::Uninitialized)
    }

    fn item_set(&self, key: &str) -> Arc<CacheItemSet> {
        if let Some(set) = self
            .sets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(set);
        }
        let mut sets = self.sets.write().unwrap_or_else(PoisonError::into_inner);
        let set = sets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CacheItemSet::new(key, self.schema.period)));
        Arc::clone(set)
    }

    /// Populates the board from `loader` unless it is loaded and fresh.
    ///
    /// Concurrent callers share one load: under [`LoadPolicy::Wait`] they
    /// wait for it, under [`LoadPolicy::FailFast`] they get a
    /// [`CacheError::LoadFailure`]. A failed load leaves the key
    /// uninitialized so the next access retries.
    pub async fn load_on_miss(&self, key: &str, loader: &dyn BackingLoader<T>) -> Result<()> {
        let set = self.item_set(key);
        loop {
            if set.is_fresh() {
                return Ok(());
            }
            if set.try_begin_load() {
                let guard = LoadGuard::new(&set);
                return match self.populate(key, loader).await {
                    Ok(rows) => {
                        guard.succeed();
                        tracing::debug!(key, rows, "Leaderboard loaded");
                        Ok(())
                    }
                    Err(e) => {
                        guard.fail();
                        tracing::warn!(key, error = %e, "Leaderboard load failed");
                        Err(e)
                    }
                };
            }

            match self.policy {
                LoadPolicy::FailFast => {
                    return Err(CacheError::LoadFailure {
                        key: key.to_string(),
                        reason: "load in progress".to_string(),
                    });
                }
                LoadPolicy::Wait => {
                    if set.wait_for_load().await == LoadState::Uninitialized {
                        return Err(CacheError::LoadFailure {
                            key: key.to_string(),
                            reason: "concurrent load failed".to_string(),
                        });
                    }
                }
            }
        }
    }

    /// [`load_on_miss`](Self::load_on_miss) followed by
    /// [`take_range`](Self::take_range).
    pub async fn take_range_or_load(
        &self,
        key: &str,
        count: i64,
        loader: &dyn BackingLoader<T>,
    ) -> Result<Vec<T>> {
        self.load_on_miss(key, loader).await?;
        self.take_range(key, count).await
    }

    /// Fetches rows, groups them by board and replaces each board. The
    /// requested board is replaced even when no rows belong to it.
    async fn populate(&self, key: &str, loader: &dyn BackingLoader<T>) -> Result<usize> {
        let mut rows = loader
            .load(key)
            .await
            .map_err(|e| CacheError::LoadFailure {
                key: key.to_string(),
                reason: format!("{:#}", e),
            })?;

        let mut boards: BTreeMap<String, Vec<(f64, Vec<u8>)>> = BTreeMap::new();
        boards.insert(key.to_string(), Vec::new());
        for row in rows.iter_mut() {
            row.reset();
            if row.is_deleted() {
                continue;
            }
            boards
                .entry(row.rank_key())
                .or_default()
                .push((row.score(), self.member_of(row)?));
        }

        let mut conn = self.context.acquire().await?;
        for (board, members) in boards {
            let set_id = self.set_id(&board);
            let result = replace_board(&mut *conn, &set_id, members, self.schema.capacity).await;
            discard_on_fault(&mut conn, result)?;
        }
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use gamecache_core::cache::Entity;
    use gamecache_core::schema::{CacheType, StorageVersion};

    use crate::entity::fixtures::{context, raw};
    use crate::rank::LoaderFn;
    use crate::store::{MemoryConnector, MemoryStore};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PlayerRank {
        id: String,
        board: String,
        score: f64,
        #[serde(skip)]
        deleted: bool,
    }

    impl Entity for PlayerRank {
        fn schema() -> SchemaTable {
            SchemaTable::new("Game.PlayerRank")
                .with_keys(&["Id"])
                .with_cache_type(CacheType::Rank)
        }

        fn key_code(&self) -> String {
            self.id.clone()
        }

        fn is_deleted(&self) -> bool {
            self.deleted
        }
    }

    impl RankEntity for PlayerRank {
        fn score(&self) -> f64 {
            self.score
        }

        fn set_score(&mut self, score: f64) {
            self.score = score;
        }

        fn rank_key(&self) -> String {
            self.board.clone()
        }
    }

    /// Same rows, capped at three per board and refreshed every 50ms.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ArenaRank(PlayerRank);

    impl Entity for ArenaRank {
        fn schema() -> SchemaTable {
            SchemaTable::new("Game.ArenaRank")
                .with_keys(&["Id"])
                .with_cache_type(CacheType::Rank)
                .with_capacity(3)
                .with_period(Duration::from_millis(50))
        }

        fn key_code(&self) -> String {
            self.0.id.clone()
        }
    }

    impl RankEntity for ArenaRank {
        fn score(&self) -> f64 {
            self.0.score
        }

        fn set_score(&mut self, score: f64) {
            self.0.score = score;
        }

        fn rank_key(&self) -> String {
            self.0.board.clone()
        }
    }

    /// Scored rows whose schema was not declared as a leaderboard.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct HallOfFame(PlayerRank);

    impl Entity for HallOfFame {
        fn schema() -> SchemaTable {
            SchemaTable::new("Game.HallOfFame").with_keys(&["Id"])
        }

        fn key_code(&self) -> String {
            self.0.id.clone()
        }
    }

    impl RankEntity for HallOfFame {
        fn score(&self) -> f64 {
            self.0.score
        }

        fn set_score(&mut self, score: f64) {
            self.0.score = score;
        }

        fn rank_key(&self) -> String {
            self.0.board.clone()
        }
    }

    fn player(id: &str, score: f64) -> PlayerRank {
        PlayerRank {
            id: id.into(),
            board: "L1".into(),
            score,
            deleted: false,
        }
    }

    fn arena(id: &str, score: f64) -> ArenaRank {
        ArenaRank(player(id, score))
    }

    fn ranks(store: &MemoryStore) -> RankCache<PlayerRank, MemoryConnector> {
        RankCache::new(Arc::new(context(store, StorageVersion::HashMultiKeyMap))).unwrap()
    }

    fn standings(rows: &[PlayerRank]) -> Vec<(&str, f64)> {
        rows.iter().map(|r| (r.id.as_str(), r.score)).collect()
    }

    #[tokio::test]
    async fn test_leaderboard_scenario() {
        let cache = ranks(&MemoryStore::new());
        cache
            .add_range(
                "L1",
                &[player("a", 10.0), player("b", 30.0), player("c", 20.0)],
            )
            .await
            .unwrap();

        let rows = cache.take_range("L1", -1).await.unwrap();
        assert_eq!(standings(&rows), vec![("b", 30.0), ("c", 20.0), ("a", 10.0)]);

        let swapped = cache
            .exchange_score("L1", &player("a", 10.0), &player("b", 30.0))
            .await
            .unwrap();
        assert!(swapped);
        let rows = cache.take_range("L1", -1).await.unwrap();
        assert_eq!(standings(&rows), vec![("a", 30.0), ("c", 20.0), ("b", 10.0)]);

        let removed = cache.remove_by_score_range("L1", 15.0, 25.0).await.unwrap();
        assert_eq!(removed, 1);
        let rows = cache.take_range("L1", -1).await.unwrap();
        assert_eq!(standings(&rows), vec![("a", 30.0), ("b", 10.0)]);
    }

    #[tokio::test]
    async fn test_ties_keep_insertion_order() {
        let cache = ranks(&MemoryStore::new());
        cache
            .add_range("L1", &[player("z", 5.0), player("m", 5.0)])
            .await
            .unwrap();
        cache
            .add_range("L1", &[player("a", 5.0), player("top", 9.0)])
            .await
            .unwrap();

        let rows = cache.take_range("L1", -1).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["top", "z", "m", "a"]);
    }

    #[tokio::test]
    async fn test_score_change_keeps_member_identity() {
        let cache = ranks(&MemoryStore::new());
        cache.add_range("L1", &[player("a", 1.0)]).await.unwrap();
        cache.update_ranks("L1", &[player("a", 50.0)]).await.unwrap();

        let rows = cache.take_range("L1", -1).await.unwrap();
        assert_eq!(standings(&rows), vec![("a", 50.0)]);
    }

    #[tokio::test]
    async fn test_update_ranks_removes_deleted_rows() {
        let store = MemoryStore::new();
        let cache = ranks(&store);
        cache
            .add_range("L1", &[player("a", 1.0), player("b", 2.0)])
            .await
            .unwrap();

        let mut gone = player("a", 1.0);
        gone.deleted = true;
        cache
            .update_ranks("L1", &[gone, player("c", 3.0)])
            .await
            .unwrap();

        let rows = cache.take_range("L1", -1).await.unwrap();
        assert_eq!(standings(&rows), vec![("c", 3.0), ("b", 2.0)]);
        let mut conn = raw(&store).await;
        let order = conn
            .hkeys(&rank_order_key(&cache.set_id("L1")))
            .await
            .unwrap();
        assert_eq!(order.len(), 3, "counter plus two live members");
    }

    #[tokio::test]
    async fn test_take_range_count() {
        let cache = ranks(&MemoryStore::new());
        cache
            .add_range(
                "L1",
                &[player("a", 1.0), player("b", 2.0), player("c", 3.0)],
            )
            .await
            .unwrap();

        let top = cache.take_range("L1", 2).await.unwrap();
        assert_eq!(standings(&top), vec![("c", 3.0), ("b", 2.0)]);
        assert!(cache.take_range("L1", 0).await.unwrap().is_empty());
        assert!(cache.take_range("empty", -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_truncates_stored_board() {
        let store = MemoryStore::new();
        let cache: RankCache<ArenaRank, _> =
            RankCache::new(Arc::new(context(&store, StorageVersion::HashMultiKeyMap))).unwrap();
        cache
            .add_range(
                "L1",
                &[arena("a", 1.0), arena("b", 4.0), arena("c", 3.0), arena("d", 2.0)],
            )
            .await
            .unwrap();
        cache.add_range("L1", &[arena("e", 3.0)]).await.unwrap();

        let rows = cache.take_range("L1", -1).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.0.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "e"]);
        assert_eq!(cache.take_range("L1", 10).await.unwrap().len(), 3);

        let mut conn = raw(&store).await;
        assert_eq!(
            conn.zrevrange_withscores(&cache.set_id("L1"), None)
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_remove_by_score_range_is_inclusive() {
        let cache = ranks(&MemoryStore::new());
        cache
            .add_range(
                "L1",
                &[
                    player("a", 10.0),
                    player("b", 15.0),
                    player("c", 25.0),
                    player("d", 26.0),
                ],
            )
            .await
            .unwrap();

        assert_eq!(cache.remove_by_score_range("L1", 15.0, 25.0).await.unwrap(), 2);
        assert_eq!(cache.remove_by_score_range("L1", 100.0, 200.0).await.unwrap(), 0);
        let rows = cache.take_range("L1", -1).await.unwrap();
        assert_eq!(standings(&rows), vec![("d", 26.0), ("a", 10.0)]);
    }

    #[tokio::test]
    async fn test_exchange_with_missing_member_changes_nothing() {
        let cache = ranks(&MemoryStore::new());
        cache.add_range("L1", &[player("a", 10.0)]).await.unwrap();

        let swapped = cache
            .exchange_score("L1", &player("a", 10.0), &player("ghost", 99.0))
            .await
            .unwrap();
        assert!(!swapped);
        assert_eq!(
            standings(&cache.take_range("L1", -1).await.unwrap()),
            vec![("a", 10.0)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_half_an_exchange() {
        let cache = Arc::new(ranks(&MemoryStore::new()));
        cache
            .add_range("L1", &[player("a", 10.0), player("b", 30.0)])
            .await
            .unwrap();

        let writer = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for _ in 0..50 {
                    cache
                        .exchange_score("L1", &player("a", 0.0), &player("b", 0.0))
                        .await
                        .unwrap();
                }
            })
        };
        for _ in 0..50 {
            let rows = cache.take_range("L1", -1).await.unwrap();
            let mut scores: Vec<f64> = rows.iter().map(|r| r.score).collect();
            scores.sort_by(f64::total_cmp);
            assert_eq!(scores, vec![10.0, 30.0]);
        }
        writer.await.unwrap();
    }

    struct CountingLoader {
        calls: AtomicUsize,
        rows: Vec<PlayerRank>,
        fail: bool,
    }

    impl CountingLoader {
        fn new(rows: Vec<PlayerRank>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                rows,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl BackingLoader<PlayerRank> for CountingLoader {
        async fn load(&self, _key: &str) -> anyhow::Result<Vec<PlayerRank>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                anyhow::bail!("database unavailable");
            }
            Ok(self.rows.clone())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_load_once() {
        let cache = Arc::new(ranks(&MemoryStore::new()));
        let loader = Arc::new(CountingLoader::new(vec![
            player("a", 1.0),
            player("b", 2.0),
        ]));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let loader = Arc::clone(&loader);
                tokio::spawn(async move { cache.take_range_or_load("L1", -1, loader.as_ref()).await })
            })
            .collect();
        for task in tasks {
            let rows = task.await.unwrap().unwrap();
            assert_eq!(standings(&rows), vec![("b", 2.0), ("a", 1.0)]);
        }

        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.load_state("L1"), LoadState::Ready);
    }

    #[tokio::test]
    async fn test_failed_load_reverts_and_retries() {
        let cache = ranks(&MemoryStore::new());
        let mut failing = CountingLoader::new(Vec::new());
        failing.fail = true;

        let err = cache.load_on_miss("L1", &failing).await.unwrap_err();
        assert!(
            matches!(err, CacheError::LoadFailure { ref reason, .. } if reason.contains("database unavailable"))
        );
        assert_eq!(cache.load_state("L1"), LoadState::Uninitialized);

        let loader = CountingLoader::new(vec![player("a", 1.0)]);
        cache.load_on_miss("L1", &loader).await.unwrap();
        assert_eq!(cache.load_state("L1"), LoadState::Ready);
        assert_eq!(cache.take_range("L1", -1).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fail_fast_policy_rejects_concurrent_miss() {
        let cache = Arc::new(ranks(&MemoryStore::new()).with_policy(LoadPolicy::FailFast));
        let loader = Arc::new(CountingLoader::new(vec![player("a", 1.0)]));

        let leader = {
            let cache = Arc::clone(&cache);
            let loader = Arc::clone(&loader);
            tokio::spawn(async move { cache.load_on_miss("L1", loader.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = cache.load_on_miss("L1", loader.as_ref()).await.unwrap_err();
        assert!(matches!(err, CacheError::LoadFailure { .. }));
        leader.await.unwrap().unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_groups_rows_by_board() {
        let cache = ranks(&MemoryStore::new());
        let mut other = player("x", 7.0);
        other.board = "L2".into();
        let loader = LoaderFn(move |_key: String| {
            let rows = vec![player("a", 1.0), other.clone()];
            async move { Ok::<_, anyhow::Error>(rows) }
        });

        cache.load_on_miss("L1", &loader).await.unwrap();
        let first = cache.take_range("L1", -1).await.unwrap();
        assert_eq!(standings(&first), vec![("a", 1.0)]);
        let second = cache.take_range("L2", -1).await.unwrap();
        assert_eq!(standings(&second), vec![("x", 7.0)]);
    }

    #[tokio::test]
    async fn test_reload_replaces_board_after_period() {
        let store = MemoryStore::new();
        let cache: RankCache<ArenaRank, _> =
            RankCache::new(Arc::new(context(&store, StorageVersion::HashMultiKeyMap))).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = {
            let calls = Arc::clone(&calls);
            LoaderFn(move |_key: String| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok::<_, anyhow::Error>(if n == 0 {
                        vec![arena("a", 1.0), arena("b", 2.0)]
                    } else {
                        vec![arena("c", 3.0)]
                    })
                }
            })
        };

        cache.load_on_miss("L1", &loader).await.unwrap();
        cache.load_on_miss("L1", &loader).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.load_state("L1"), LoadState::Stale);
        cache.load_on_miss("L1", &loader).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let rows = cache.take_range("L1", -1).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.0.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn test_read_limit() {
        assert_eq!(read_limit(-1, 0), None);
        assert_eq!(read_limit(-1, 10), Some(10));
        assert_eq!(read_limit(5, 10), Some(5));
        assert_eq!(read_limit(50, 10), Some(10));
        assert_eq!(read_limit(5, 0), Some(5));
    }

    #[tokio::test]
    async fn test_rejects_non_rank_types() {
        let ctx = Arc::new(context(&MemoryStore::new(), StorageVersion::HashMultiKeyMap));
        let err = RankCache::<HallOfFame, _>::new(ctx).err();
        assert!(
            matches!(err, Some(CacheError::InvalidConfig(ref reason)) if reason.contains("Game.HallOfFame"))
        );
    }
}
