//! Optimistic read-check-write transactions.
//!
//! [`transactional_update`] watches a set of keys, runs a [`Precondition`]
//! against the current data, stages writes into a [`Transaction`] and commits
//! them with MULTI/EXEC. The outcome says whether the writes were applied,
//! skipped because the precondition did not hold, or lost to a concurrent
//! writer. Retrying a conflict is the caller's decision.

use async_trait::async_trait;

use gamecache_core::{CacheError, Result};

use crate::store::{StoreConnection, WriteOp};

/// Writes queued for one MULTI/EXEC block.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Transaction {
    ops: Vec<WriteOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, ops: impl IntoIterator<Item = WriteOp>) {
        self.ops.extend(ops);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// The read step of a transaction, run after the watch is in place.
///
/// Returns `None` when the transaction does not apply.
#[async_trait]
pub trait Precondition<C: StoreConnection>: Send {
    type Output: Send;

    async fn check(&mut self, conn: &mut C) -> Result<Option<Self::Output>>;
}

/// Outcome of [`transactional_update`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome<V> {
    /// The writes were committed. Carries the precondition output.
    Applied(V),
    /// The precondition did not hold; nothing was written.
    NotApplicable,
    /// A watched key changed before commit; nothing was written.
    Conflict,
}

impl<V> TransactionOutcome<V> {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransactionOutcome::Applied(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, TransactionOutcome::Conflict)
    }

    pub fn applied(self) -> Option<V> {
        match self {
            TransactionOutcome::Applied(v) => Some(v),
            _ => None,
        }
    }
}

/// Callback invoked with an error raised while checking or staging.
pub type ErrorCallback<'a> = &'a (dyn Fn(&CacheError) + Send + Sync);

/// Watches `watch_keys`, checks `precondition`, stages writes with `apply`
/// and commits them atomically.
///
/// Errors from the precondition or from `apply` release the watch, are
/// passed to `on_error` and returned. Commit conflicts are not errors.
pub async fn transactional_update<C, P, A>(
    conn: &mut C,
    watch_keys: &[String],
    precondition: &mut P,
    apply: A,
    on_error: Option<ErrorCallback<'_>>,
) -> Result<TransactionOutcome<P::Output>>
where
    C: StoreConnection,
    P: Precondition<C>,
    A: FnOnce(&P::Output, &mut Transaction) -> Result<()> + Send,
{
    let mut watch = WatchGuard::new(conn);
    watch.conn.watch(watch_keys).await?;

    let staged = match precondition.check(&mut *watch.conn).await {
        Ok(Some(output)) => {
            let mut tx = Transaction::new();
            apply(&output, &mut tx).map(|_| (output, tx))
        }
        Ok(None) => {
            let released = watch.conn.unwatch().await;
            watch.release();
            released?;
            return Ok(TransactionOutcome::NotApplicable);
        }
        Err(e) => Err(e),
    };

    let (output, tx) = match staged {
        Ok(staged) => staged,
        Err(e) => {
            if let Err(unwatch) = watch.conn.unwatch().await {
                tracing::warn!(error = %unwatch, "Failed to release watch after staging error");
            }
            watch.release();
            if let Some(on_error) = on_error {
                on_error(&e);
            }
            return Err(e);
        }
    };

    let committed = watch.conn.exec(tx.into_ops()).await;
    watch.release();
    if committed? {
        Ok(TransactionOutcome::Applied(output))
    } else {
        tracing::debug!(keys = ?watch_keys, "Transaction aborted by concurrent write");
        Ok(TransactionOutcome::Conflict)
    }
}

/// Marks the connection faulted unless the watch was released, so a
/// transaction abandoned between WATCH and EXEC never hands a watching
/// connection back to the pool.
struct WatchGuard<'a, C: StoreConnection> {
    conn: &'a mut C,
    armed: bool,
}

impl<'a, C: StoreConnection> WatchGuard<'a, C> {
    fn new(conn: &'a mut C) -> Self {
        Self { conn, armed: true }
    }

    fn release(&mut self) {
        self.armed = false;
    }
}

impl<C: StoreConnection> Drop for WatchGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("Transaction abandoned while watching; discarding connection");
            self.conn.mark_faulted();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConnection, MemoryConnector, StoreConnector};
    use gamecache_core::endpoint::Endpoint;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reads a counter and applies when it is below a limit.
    struct BelowLimit {
        key: String,
        limit: i64,
        interfere: Option<MemoryConnection>,
    }

    #[async_trait]
    impl Precondition<MemoryConnection> for BelowLimit {
        type Output = i64;

        async fn check(&mut self, conn: &mut MemoryConnection) -> Result<Option<i64>> {
            let current = match conn.get(&self.key).await? {
                Some(bytes) => String::from_utf8_lossy(&bytes).parse().unwrap_or(0),
                None => 0,
            };
            if let Some(other) = self.interfere.as_mut() {
                other.incr_by(&self.key, 1).await?;
            }
            Ok((current < self.limit).then_some(current))
        }
    }

    async fn connect(connector: &MemoryConnector) -> MemoryConnection {
        connector
            .connect(&Endpoint::parse("memory").unwrap(), 0)
            .await
            .unwrap()
    }

    fn set_to(key: &str, value: i64) -> WriteOp {
        WriteOp::Set {
            key: key.to_string(),
            value: value.to_string().into_bytes(),
        }
    }

    #[tokio::test]
    async fn test_applies_when_precondition_holds() {
        let connector = MemoryConnector::default();
        let mut conn = connect(&connector).await;
        let mut check = BelowLimit {
            key: "n".into(),
            limit: 10,
            interfere: None,
        };

        let outcome = transactional_update(
            &mut conn,
            &["n".to_string()],
            &mut check,
            |current, tx| {
                tx.push(set_to("n", current + 5));
                Ok(())
            },
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome, TransactionOutcome::Applied(0));
        assert_eq!(conn.get("n").await.unwrap(), Some(b"5".to_vec()));
    }

    #[tokio::test]
    async fn test_not_applicable_writes_nothing() {
        let connector = MemoryConnector::default();
        let mut conn = connect(&connector).await;
        conn.incr_by("n", 10).await.unwrap();
        let mut check = BelowLimit {
            key: "n".into(),
            limit: 10,
            interfere: None,
        };

        let outcome = transactional_update(
            &mut conn,
            &["n".to_string()],
            &mut check,
            |_, tx| {
                tx.push(set_to("n", 0));
                Ok(())
            },
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome, TransactionOutcome::NotApplicable);
        assert_eq!(conn.get("n").await.unwrap(), Some(b"10".to_vec()));
    }

    #[tokio::test]
    async fn test_concurrent_write_reports_conflict() {
        let connector = MemoryConnector::default();
        let mut conn = connect(&connector).await;
        let mut check = BelowLimit {
            key: "n".into(),
            limit: 10,
            interfere: Some(connect(&connector).await),
        };

        let outcome = transactional_update(
            &mut conn,
            &["n".to_string()],
            &mut check,
            |current, tx| {
                tx.push(set_to("n", current + 5));
                Ok(())
            },
            None,
        )
        .await
        .unwrap();

        assert!(outcome.is_conflict());
        assert_eq!(conn.get("n").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_staging_error_rolls_back_and_reports() {
        let connector = MemoryConnector::default();
        let mut conn = connect(&connector).await;
        let mut check = BelowLimit {
            key: "n".into(),
            limit: 10,
            interfere: None,
        };
        let reported = AtomicUsize::new(0);
        let on_error = |e: &CacheError| {
            assert!(matches!(e, CacheError::Serialization(_)));
            reported.fetch_add(1, Ordering::SeqCst);
        };

        let err = transactional_update(
            &mut conn,
            &["n".to_string()],
            &mut check,
            |_, tx| {
                tx.push(set_to("n", 99));
                Err(CacheError::Serialization("cannot encode".into()))
            },
            Some(&on_error),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CacheError::Serialization(_)));
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(conn.get("n").await.unwrap(), None);

        // The watch was released, so a later write from elsewhere does not
        // poison the next transaction on this connection.
        let mut other = connect(&connector).await;
        other.incr_by("n", 1).await.unwrap();
        assert!(conn.exec(vec![set_to("m", 1)]).await.unwrap());
    }

    /// Never finishes its read, like a caller that is cancelled mid-check.
    struct Stall;

    #[async_trait]
    impl Precondition<MemoryConnection> for Stall {
        type Output = ();

        async fn check(&mut self, _conn: &mut MemoryConnection) -> Result<Option<()>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_abandoned_transaction_discards_the_connection() {
        let connector = MemoryConnector::default();
        let mut conn = connect(&connector).await;

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            transactional_update(
                &mut conn,
                &["n".to_string()],
                &mut Stall,
                |_, _| Ok(()),
                None,
            ),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(conn.is_faulted());
    }

    #[tokio::test]
    async fn test_finished_transactions_keep_the_connection() {
        let connector = MemoryConnector::default();
        let mut conn = connect(&connector).await;
        for limit in [10, 0] {
            let mut check = BelowLimit {
                key: "n".into(),
                limit,
                interfere: None,
            };
            transactional_update(
                &mut conn,
                &["n".to_string()],
                &mut check,
                |current, tx| {
                    tx.push(set_to("n", current + 1));
                    Ok(())
                },
                None,
            )
            .await
            .unwrap();
        }
        assert!(!conn.is_faulted());
    }

    #[test]
    fn test_outcome_helpers() {
        assert_eq!(TransactionOutcome::Applied(3).applied(), Some(3));
        assert!(TransactionOutcome::<()>::NotApplicable.applied().is_none());
        assert!(!TransactionOutcome::<()>::Conflict.is_applied());
    }
}
