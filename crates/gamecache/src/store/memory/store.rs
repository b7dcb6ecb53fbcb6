//! In-process keyspace with Redis data-type semantics.
//!
//! Values are typed (string, hash, set, sorted set) and a command against the
//! wrong type fails the way Redis does. Every write bumps a per-key version so
//! connections can implement WATCH by comparing versions at EXEC time. Empty
//! containers are removed, and expired strings disappear lazily on access.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use gamecache_core::{CacheError, Result};

use crate::store::WriteOp;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Value {
    Str(Vec<u8>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
    Set(BTreeSet<Vec<u8>>),
    ZSet(HashMap<Vec<u8>, f64>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::ZSet(z) => z.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::OperationFailed(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
        key
    ))
}

/// Sorted-set members ordered by ascending score, ties by member bytes.
pub(super) fn zset_ascending(zset: &HashMap<Vec<u8>, f64>) -> Vec<(Vec<u8>, f64)> {
    let mut members: Vec<(Vec<u8>, f64)> = zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    members
}

#[derive(Debug, Default)]
pub(super) struct State {
    data: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
    clock: u64,
}

impl State {
    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
    }

    pub(super) fn version(&mut self, key: &str) -> u64 {
        self.purge_expired(key);
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn purge_expired(&mut self, key: &str) {
        if self.data.get(key).is_some_and(Entry::is_expired) {
            self.data.remove(key);
            self.touch(key);
        }
    }

    pub(super) fn value(&mut self, key: &str) -> Option<&Value> {
        self.purge_expired(key);
        self.data.get(key).map(|e| &e.value)
    }

    pub(super) fn keys(&mut self) -> Vec<String> {
        let expired: Vec<String> = self
            .data
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.purge_expired(&key);
        }
        let mut keys: Vec<String> = self.data.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub(super) fn string(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Str(v)) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    pub(super) fn hash(&mut self, key: &str) -> Result<Option<&BTreeMap<Vec<u8>, Vec<u8>>>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    pub(super) fn set(&mut self, key: &str) -> Result<Option<&BTreeSet<Vec<u8>>>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Set(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    pub(super) fn zset(&mut self, key: &str) -> Result<Option<&HashMap<Vec<u8>, f64>>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::ZSet(z)) => Ok(Some(z)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Runs `f` on the value at `key`, creating it with `init` when missing.
    /// The key is versioned and dropped again if the value ends up empty.
    fn modify<R>(
        &mut self,
        key: &str,
        init: fn() -> Value,
        f: impl FnOnce(&mut Value) -> Option<R>,
    ) -> Result<R> {
        self.purge_expired(key);
        let entry = self.data.entry(key.to_string()).or_insert_with(|| Entry {
            value: init(),
            expires_at: None,
        });
        let result = f(&mut entry.value);
        let empty = entry.value.is_empty();
        if empty {
            self.data.remove(key);
        }
        match result {
            Some(r) => {
                self.touch(key);
                Ok(r)
            }
            None => Err(wrong_type(key)),
        }
    }

    pub(super) fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        let current = match self.string(key)? {
            None => 0,
            Some(bytes) => parse_integer(key, &bytes)?,
        };
        let next = checked_add(current, delta)?;
        self.data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string().into_bytes()),
                expires_at: None,
            },
        );
        self.touch(key);
        Ok(next)
    }

    pub(super) fn hincr_by(&mut self, key: &str, field: &[u8], delta: i64) -> Result<i64> {
        let current = match self.hash(key)?.and_then(|h| h.get(field)) {
            None => 0,
            Some(bytes) => parse_integer(key, bytes)?,
        };
        let next = checked_add(current, delta)?;
        self.modify(
            key,
            || Value::Hash(BTreeMap::new()),
            |value| match value {
                Value::Hash(h) => {
                    h.insert(field.to_vec(), next.to_string().into_bytes());
                    Some(next)
                }
                _ => None,
            },
        )
    }

    pub(super) fn apply(&mut self, op: &WriteOp) -> Result<()> {
        match op {
            WriteOp::Set { key, value } => self.put_string(key, value, None),
            WriteOp::SetEx {
                key,
                value,
                seconds,
            } => self.put_string(key, value, Some(Duration::from_secs(*seconds))),
            WriteOp::Del { keys } => {
                for key in keys {
                    if self.data.remove(key).is_some() {
                        self.touch(key);
                    }
                }
                Ok(())
            }
            WriteOp::HSet { key, fields } => self.modify(
                key,
                || Value::Hash(BTreeMap::new()),
                |value| match value {
                    Value::Hash(h) => {
                        h.extend(fields.iter().cloned());
                        Some(())
                    }
                    _ => None,
                },
            ),
            WriteOp::HSetNx { key, field, value } => self.modify(
                key,
                || Value::Hash(BTreeMap::new()),
                |v| match v {
                    Value::Hash(h) => {
                        h.entry(field.clone()).or_insert_with(|| value.clone());
                        Some(())
                    }
                    _ => None,
                },
            ),
            WriteOp::HDel { key, fields } => self.modify(
                key,
                || Value::Hash(BTreeMap::new()),
                |value| match value {
                    Value::Hash(h) => {
                        for field in fields {
                            h.remove(field);
                        }
                        Some(())
                    }
                    _ => None,
                },
            ),
            WriteOp::SAdd { key, members } => self.modify(
                key,
                || Value::Set(BTreeSet::new()),
                |value| match value {
                    Value::Set(s) => {
                        s.extend(members.iter().cloned());
                        Some(())
                    }
                    _ => None,
                },
            ),
            WriteOp::SRem { key, members } => self.modify(
                key,
                || Value::Set(BTreeSet::new()),
                |value| match value {
                    Value::Set(s) => {
                        for member in members {
                            s.remove(member);
                        }
                        Some(())
                    }
                    _ => None,
                },
            ),
            WriteOp::ZAdd { key, members } => self.modify(
                key,
                || Value::ZSet(HashMap::new()),
                |value| match value {
                    Value::ZSet(z) => {
                        for (score, member) in members {
                            z.insert(member.clone(), *score);
                        }
                        Some(())
                    }
                    _ => None,
                },
            ),
            WriteOp::ZRem { key, members } => self.modify(
                key,
                || Value::ZSet(HashMap::new()),
                |value| match value {
                    Value::ZSet(z) => {
                        for member in members {
                            z.remove(member);
                        }
                        Some(())
                    }
                    _ => None,
                },
            ),
            WriteOp::ZRemRangeByScore { key, min, max } => self.modify(
                key,
                || Value::ZSet(HashMap::new()),
                |value| match value {
                    Value::ZSet(z) => {
                        z.retain(|_, score| *score < *min || *score > *max);
                        Some(())
                    }
                    _ => None,
                },
            ),
        }
    }

    fn put_string(&mut self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_vec()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        self.touch(key);
        Ok(())
    }
}

fn parse_integer(key: &str, bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            CacheError::OperationFailed(format!(
                "ERR value is not an integer or out of range: {}",
                key
            ))
        })
}

fn checked_add(current: i64, delta: i64) -> Result<i64> {
    current.checked_add(delta).ok_or_else(|| {
        CacheError::OperationFailed("ERR increment or decrement would overflow".to_string())
    })
}

/// Shared in-process keyspace.
///
/// Clones share the same data. Taking the store offline makes every
/// connection command fail with a connection fault, which is how tests
/// exercise the pool's disposal path.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    pub(super) state: Arc<Mutex<State>>,
    online: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Applies writes directly, bypassing connections.
    pub async fn apply(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut state = self.state.lock().await;
        for op in &ops {
            state.apply(op)?;
        }
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.state.lock().await.value(key).is_some()
    }

    /// Every live key, sorted.
    pub async fn keys(&self) -> Vec<String> {
        self.state.lock().await.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn test_zset_ascending_breaks_ties_by_member() {
        let mut z = HashMap::new();
        z.insert(b("b"), 1.0);
        z.insert(b("a"), 1.0);
        z.insert(b("c"), 0.5);
        let ordered: Vec<Vec<u8>> = zset_ascending(&z).into_iter().map(|(m, _)| m).collect();
        assert_eq!(ordered, vec![b("c"), b("a"), b("b")]);
    }

    #[tokio::test]
    async fn test_writes_bump_versions_and_drop_empty_containers() {
        let store = MemoryStore::new();
        let mut state = store.state.lock().await;
        assert_eq!(state.version("h"), 0);

        state
            .apply(&WriteOp::HSet {
                key: "h".into(),
                fields: vec![(b("f"), b("v"))],
            })
            .unwrap();
        let v1 = state.version("h");
        assert!(v1 > 0);

        state
            .apply(&WriteOp::HDel {
                key: "h".into(),
                fields: vec![b("f")],
            })
            .unwrap();
        assert!(state.version("h") > v1);
        assert!(state.value("h").is_none());
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected() {
        let store = MemoryStore::new();
        store
            .apply(vec![WriteOp::Set {
                key: "k".into(),
                value: b("v"),
            }])
            .await
            .unwrap();
        let err = store
            .apply(vec![WriteOp::SAdd {
                key: "k".into(),
                members: vec![b("m")],
            }])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("WRONGTYPE"));
        assert!(store.exists("k").await);
    }

    #[tokio::test]
    async fn test_incr_by_rejects_non_integers() {
        let store = MemoryStore::new();
        let mut state = store.state.lock().await;
        assert_eq!(state.incr_by("n", 5).unwrap(), 5);
        assert_eq!(state.incr_by("n", -2).unwrap(), 3);
        state
            .apply(&WriteOp::Set {
                key: "s".into(),
                value: b("abc"),
            })
            .unwrap();
        assert!(state.incr_by("s", 1).is_err());
    }

    #[tokio::test]
    async fn test_set_ex_expires() {
        let store = MemoryStore::new();
        store
            .apply(vec![WriteOp::SetEx {
                key: "t".into(),
                value: b("v"),
                seconds: 0,
            }])
            .await
            .unwrap();
        assert!(!store.exists("t").await);
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_keys_are_sorted() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                WriteOp::Set {
                    key: "b".into(),
                    value: b("1"),
                },
                WriteOp::Set {
                    key: "a".into(),
                    value: b("1"),
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.keys().await, vec!["a".to_string(), "b".to_string()]);
    }
}
