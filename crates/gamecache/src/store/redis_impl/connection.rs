use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Cmd, FromRedisValue, RedisResult};

use gamecache_core::endpoint::Endpoint;
use gamecache_core::{CacheError, Result};

use super::error::map_redis_error;
use crate::store::{StoreConnection, StoreConnector, WriteOp};

/// Keys requested per SCAN round trip.
const SCAN_COUNT: usize = 500;

/// Opens Redis connections with a bounded connect time.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

/// Builds a `redis://` URL for an endpoint and database index.
pub(crate) fn connection_url(endpoint: &Endpoint, db_index: i64) -> String {
    match &endpoint.password {
        Some(password) => format!(
            "redis://:{}@{}:{}/{}",
            urlencoding::encode(password),
            endpoint.host,
            endpoint.port,
            db_index
        ),
        None => format!("redis://{}:{}/{}", endpoint.host, endpoint.port, db_index),
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    type Connection = RedisConnection;

    async fn connect(&self, endpoint: &Endpoint, db_index: i64) -> Result<RedisConnection> {
        let client =
            redis::Client::open(connection_url(endpoint, db_index)).map_err(map_redis_error)?;
        let conn = tokio::time::timeout(
            self.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| CacheError::Timeout(self.connect_timeout.as_millis() as u64))?
        .map_err(map_redis_error)?;

        tracing::debug!(endpoint = %endpoint, db = db_index, "Redis connection opened");
        Ok(RedisConnection {
            conn,
            faulted: false,
        })
    }
}

/// One leased Redis connection.
pub struct RedisConnection {
    conn: MultiplexedConnection,
    faulted: bool,
}

impl RedisConnection {
    fn track<T>(&mut self, result: RedisResult<T>) -> Result<T> {
        result.map_err(|e| {
            let err = map_redis_error(e);
            if err.is_connection_fault() {
                self.faulted = true;
            }
            err
        })
    }

    async fn run<T: FromRedisValue + Send>(&mut self, cmd: &Cmd) -> Result<T> {
        let result: RedisResult<T> = cmd.query_async(&mut self.conn).await;
        self.track(result)
    }

    fn pipeline_of(ops: &[WriteOp]) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        for op in ops.iter().filter(|op| !op.is_empty()) {
            pipe.add_command(write_cmd(op)).ignore();
        }
        pipe
    }
}

fn write_cmd(op: &WriteOp) -> Cmd {
    match op {
        WriteOp::Set { key, value } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            cmd
        }
        WriteOp::SetEx {
            key,
            value,
            seconds,
        } => {
            let mut cmd = redis::cmd("SETEX");
            cmd.arg(key).arg(*seconds).arg(value);
            cmd
        }
        WriteOp::Del { keys } => {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(keys);
            cmd
        }
        WriteOp::HSet { key, fields } => {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd
        }
        WriteOp::HSetNx { key, field, value } => {
            let mut cmd = redis::cmd("HSETNX");
            cmd.arg(key).arg(field).arg(value);
            cmd
        }
        WriteOp::HDel { key, fields } => {
            let mut cmd = redis::cmd("HDEL");
            cmd.arg(key).arg(fields);
            cmd
        }
        WriteOp::SAdd { key, members } => {
            let mut cmd = redis::cmd("SADD");
            cmd.arg(key).arg(members);
            cmd
        }
        WriteOp::SRem { key, members } => {
            let mut cmd = redis::cmd("SREM");
            cmd.arg(key).arg(members);
            cmd
        }
        WriteOp::ZAdd { key, members } => {
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(key);
            for (score, member) in members {
                cmd.arg(*score).arg(member);
            }
            cmd
        }
        WriteOp::ZRem { key, members } => {
            let mut cmd = redis::cmd("ZREM");
            cmd.arg(key).arg(members);
            cmd
        }
        WriteOp::ZRemRangeByScore { key, min, max } => {
            let mut cmd = redis::cmd("ZREMRANGEBYSCORE");
            cmd.arg(key).arg(*min).arg(*max);
            cmd
        }
    }
}

#[async_trait]
impl StoreConnection for RedisConnection {
    async fn ping(&mut self) -> Result<()> {
        let _: String = self.run(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.run(redis::cmd("GET").arg(key)).await
    }

    async fn mget(&mut self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.run(redis::cmd("MGET").arg(keys)).await
    }

    async fn scan_match(&mut self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn hget(&mut self, key: &str, field: &[u8]) -> Result<Option<Vec<u8>>> {
        self.run(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hmget(&mut self, key: &str, fields: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        self.run(redis::cmd("HMGET").arg(key).arg(fields)).await
    }

    async fn hget_each(&mut self, reads: &[(String, Vec<u8>)]) -> Result<Vec<Option<Vec<u8>>>> {
        if reads.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for (key, field) in reads {
            pipe.cmd("HGET").arg(key).arg(field);
        }
        let result: RedisResult<Vec<Option<Vec<u8>>>> = pipe.query_async(&mut self.conn).await;
        self.track(result)
    }

    async fn hkeys(&mut self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.run(redis::cmd("HKEYS").arg(key)).await
    }

    async fn hvals(&mut self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.run(redis::cmd("HVALS").arg(key)).await
    }

    async fn smembers(&mut self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.run(redis::cmd("SMEMBERS").arg(key)).await
    }

    async fn zrevrange_withscores(
        &mut self,
        key: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        let stop: i64 = match limit {
            Some(0) => return Ok(Vec::new()),
            Some(limit) => limit as i64 - 1,
            None => -1,
        };
        self.run(
            redis::cmd("ZREVRANGE")
                .arg(key)
                .arg(0)
                .arg(stop)
                .arg("WITHSCORES"),
        )
        .await
    }

    async fn zrangebyscore(&mut self, key: &str, min: f64, max: f64) -> Result<Vec<Vec<u8>>> {
        self.run(redis::cmd("ZRANGEBYSCORE").arg(key).arg(min).arg(max))
            .await
    }

    async fn zscore(&mut self, key: &str, member: &[u8]) -> Result<Option<f64>> {
        self.run(redis::cmd("ZSCORE").arg(key).arg(member)).await
    }

    async fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        self.run(redis::cmd("INCRBY").arg(key).arg(delta)).await
    }

    async fn hincr_by(&mut self, key: &str, field: &[u8], delta: i64) -> Result<i64> {
        self.run(redis::cmd("HINCRBY").arg(key).arg(field).arg(delta))
            .await
    }

    async fn pipeline(&mut self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.iter().all(WriteOp::is_empty) {
            return Ok(());
        }
        let pipe = Self::pipeline_of(&ops);
        let result: RedisResult<()> = pipe.query_async(&mut self.conn).await;
        self.track(result)
    }

    async fn watch(&mut self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.run(redis::cmd("WATCH").arg(keys)).await
    }

    async fn unwatch(&mut self) -> Result<()> {
        self.run(&redis::cmd("UNWATCH")).await
    }

    async fn exec(&mut self, ops: Vec<WriteOp>) -> Result<bool> {
        let mut pipe = Self::pipeline_of(&ops);
        pipe.atomic();
        // EXEC replies nil when a watched key changed.
        let result: RedisResult<Option<()>> = pipe.query_async(&mut self.conn).await;
        Ok(self.track(result)?.is_some())
    }

    fn is_faulted(&self) -> bool {
        self.faulted
    }

    fn mark_faulted(&mut self) {
        self.faulted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    /// Helper to get the Redis address from environment.
    fn redis_host() -> String {
        std::env::var("GAMECACHE_TEST_REDIS").unwrap_or_else(|_| "localhost:6379".to_string())
    }

    /// Skip test if Redis not available.
    async fn get_test_connection() -> Option<RedisConnection> {
        let endpoint = Endpoint::parse(&redis_host()).ok()?;
        let mut conn = RedisConnector::new(Duration::from_millis(500))
            .connect(&endpoint, 0)
            .await
            .ok()?;
        conn.ping().await.ok()?;
        Some(conn)
    }

    /// Generate a unique test key to avoid conflicts.
    fn test_key(suffix: &str) -> String {
        format!("test:gamecache:{}:{}", Uuid::new_v4(), suffix)
    }

    #[test]
    fn test_connection_url_encodes_password() {
        let endpoint = Endpoint::parse("p@ss/word@cache:6380").unwrap();
        assert_eq!(
            connection_url(&endpoint, 2),
            "redis://:p%40ss%2Fword@cache:6380/2"
        );
        let endpoint = Endpoint::parse("cache").unwrap();
        assert_eq!(connection_url(&endpoint, 0), "redis://cache:6379/0");
    }

    #[test]
    fn test_write_cmd_packs_arguments_in_order() {
        let packed = write_cmd(&WriteOp::SetEx {
            key: "k".into(),
            value: b"v".to_vec(),
            seconds: 30,
        })
        .get_packed_command();
        let text = String::from_utf8_lossy(&packed);
        let setex = text.find("SETEX").unwrap();
        let ttl = text.find("30").unwrap();
        assert!(setex < ttl);
    }

    #[tokio::test]
    async fn test_redis_hash_round_trip() {
        let Some(mut conn) = get_test_connection().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        let key = test_key("hash");
        conn.pipeline(vec![WriteOp::HSet {
            key: key.clone(),
            fields: vec![(b"1".to_vec(), b"one".to_vec())],
        }])
        .await
        .unwrap();

        assert_eq!(conn.hget(&key, b"1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(
            conn.hmget(&key, &[b"1".to_vec(), b"2".to_vec()]).await.unwrap(),
            vec![Some(b"one".to_vec()), None]
        );

        conn.pipeline(vec![WriteOp::Del { keys: vec![key] }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_redis_sorted_set_reads() {
        let Some(mut conn) = get_test_connection().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        let key = test_key("zset");
        conn.pipeline(vec![WriteOp::ZAdd {
            key: key.clone(),
            members: vec![(10.0, b"a".to_vec()), (30.0, b"b".to_vec())],
        }])
        .await
        .unwrap();

        let top = conn.zrevrange_withscores(&key, Some(1)).await.unwrap();
        assert_eq!(top, vec![(b"b".to_vec(), 30.0)]);
        assert_eq!(conn.zscore(&key, b"a").await.unwrap(), Some(10.0));

        conn.pipeline(vec![WriteOp::Del { keys: vec![key] }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_redis_exec_reports_watch_conflict() {
        let Some(mut first) = get_test_connection().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };
        let Some(mut second) = get_test_connection().await else {
            return;
        };

        let key = test_key("watch");
        first.watch(std::slice::from_ref(&key)).await.unwrap();
        second.incr_by(&key, 1).await.unwrap();

        let applied = first
            .exec(vec![WriteOp::Set {
                key: key.clone(),
                value: b"5".to_vec(),
            }])
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(first.get(&key).await.unwrap(), Some(b"1".to_vec()));

        first
            .pipeline(vec![WriteOp::Del { keys: vec![key] }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_redis_scan_match() {
        let Some(mut conn) = get_test_connection().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        let prefix = test_key("scan");
        let keys: Vec<String> = (0..3).map(|i| format!("{}_{}", prefix, i)).collect();
        conn.pipeline(
            keys.iter()
                .map(|k| WriteOp::Set {
                    key: k.clone(),
                    value: b"x".to_vec(),
                })
                .collect(),
        )
        .await
        .unwrap();

        let found = conn.scan_match(&format!("{}_*", prefix)).await.unwrap();
        assert_eq!(found, keys);

        conn.pipeline(vec![WriteOp::Del { keys }]).await.unwrap();
    }
}
