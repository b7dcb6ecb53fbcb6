//! Bounded pool of reusable objects with idle expiry.
//!
//! A semaphore caps the number of live objects at `max_size`. Idle objects
//! are kept in a FIFO queue with the time they were returned; entries older
//! than the idle timeout are disposed lazily when an acquire walks past them.
//! Leased objects come back through the [`Pooled`] guard, which returns a
//! healthy object to the idle queue and disposes a faulted one.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use gamecache_core::{CacheError, Result};

/// Creates and checks the objects held by an [`ObjectPool`].
#[async_trait]
pub trait PoolFactory: Send + Sync + 'static {
    type Object: Send + 'static;

    async fn create(&self) -> Result<Self::Object>;

    /// Whether a returned object may be reused.
    fn is_reusable(&self, object: &Self::Object) -> bool;
}

/// Tuning for one pool.
#[derive(Debug, Clone)]
pub struct ObjectPoolConfig {
    /// Name used in logs and errors.
    pub name: String,
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

/// Pool statistics (passive data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub endpoint: String,
    pub idle: usize,
    pub live: usize,
    pub in_use: usize,
    pub max_size: usize,
}

struct IdleEntry<T> {
    object: T,
    since: Instant,
}

struct Shared<F: PoolFactory> {
    config: ObjectPoolConfig,
    factory: F,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleEntry<F::Object>>>,
    live: AtomicUsize,
}

impl<F: PoolFactory> Shared<F> {
    fn idle_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleEntry<F::Object>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispose(&self, object: F::Object, reason: &str) {
        drop(object);
        let live = self.live.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::debug!(pool = %self.config.name, live, reason, "Pooled object disposed");
    }

    /// Pops the freshest usable idle object, disposing expired ones.
    fn take_idle(&self) -> Option<F::Object> {
        let mut expired = Vec::new();
        let found = {
            let mut idle = self.idle_queue();
            loop {
                match idle.pop_front() {
                    Some(entry) if entry.since.elapsed() >= self.config.idle_timeout => {
                        expired.push(entry.object)
                    }
                    Some(entry) => break Some(entry.object),
                    None => break None,
                }
            }
        };
        for object in expired {
            self.dispose(object, "idle timeout");
        }
        found
    }
}

/// A bounded pool of objects produced by a [`PoolFactory`].
pub struct ObjectPool<F: PoolFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: PoolFactory> Clone for ObjectPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: PoolFactory> ObjectPool<F> {
    pub fn new(config: ObjectPoolConfig, factory: F) -> Result<Self> {
        if config.max_size == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "pool {} must allow at least one object",
                config.name
            )));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                permits: Arc::new(Semaphore::new(config.max_size)),
                idle: Mutex::new(VecDeque::new()),
                live: AtomicUsize::new(0),
                config,
                factory,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Leases an object, reusing an idle one or creating a new one.
    ///
    /// Waits at most the configured acquire timeout for a free slot and
    /// fails with [`CacheError::PoolExhausted`] after that.
    pub async fn acquire(&self) -> Result<Pooled<F>> {
        let shared = &self.shared;
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            shared.config.acquire_timeout,
            Arc::clone(&shared.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(CacheError::ConnectionFault(format!(
                    "pool {} is closed",
                    shared.config.name
                )))
            }
            Err(_) => {
                tracing::warn!(
                    pool = %shared.config.name,
                    max_size = shared.config.max_size,
                    "Pool exhausted"
                );
                return Err(CacheError::PoolExhausted {
                    endpoint: shared.config.name.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        let object = match shared.take_idle() {
            Some(object) => object,
            None => {
                let object = shared.factory.create().await?;
                let live = shared.live.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(pool = %shared.config.name, live, "Pooled object created");
                object
            }
        };

        Ok(Pooled {
            object: Some(object),
            shared: Arc::clone(shared),
            discard: false,
            _permit: permit,
        })
    }

    /// Fills the idle queue with up to `count` new objects.
    ///
    /// Returns how many objects are idle afterwards.
    pub async fn prewarm(&self, count: usize) -> Result<usize> {
        let count = count.min(self.shared.config.max_size);
        let mut leased = Vec::with_capacity(count);
        for _ in 0..count {
            leased.push(self.acquire().await?);
        }
        drop(leased);
        Ok(self.shared.idle_queue().len())
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.shared.idle_queue().len();
        let max_size = self.shared.config.max_size;
        PoolStats {
            endpoint: self.shared.config.name.clone(),
            idle,
            live: self.shared.live.load(Ordering::SeqCst),
            in_use: max_size - self.shared.permits.available_permits(),
            max_size,
        }
    }

    /// Disposes every idle object and refuses further acquires.
    pub fn close(&self) {
        self.shared.permits.close();
        let drained: Vec<_> = self.shared.idle_queue().drain(..).collect();
        for entry in drained {
            self.shared.dispose(entry.object, "pool closed");
        }
    }
}

/// A leased object. Dropping the guard hands the object back to its pool.
pub struct Pooled<F: PoolFactory> {
    object: Option<F::Object>,
    shared: Arc<Shared<F>>,
    discard: bool,
    // Released after the object is back in the idle queue.
    _permit: OwnedSemaphorePermit,
}

impl<F: PoolFactory> Pooled<F> {
    /// Disposes the object on release instead of reusing it.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<F: PoolFactory> Deref for Pooled<F> {
    type Target = F::Object;

    fn deref(&self) -> &F::Object {
        // Only `Drop` takes the object out.
        match &self.object {
            Some(object) => object,
            None => unreachable!("pooled object already released"),
        }
    }
}

impl<F: PoolFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut F::Object {
        match &mut self.object {
            Some(object) => object,
            None => unreachable!("pooled object already released"),
        }
    }
}

impl<F: PoolFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        let Some(object) = self.object.take() else {
            return;
        };
        if self.discard || self.shared.permits.is_closed() {
            self.shared.dispose(object, "discarded");
        } else if !self.shared.factory.is_reusable(&object) {
            self.shared.dispose(object, "faulted");
        } else {
            self.shared.idle_queue().push_back(IdleEntry {
                object,
                since: Instant::now(),
            });
        }
    }
}
