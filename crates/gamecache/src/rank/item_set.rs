//! Load state of one leaderboard key.
//!
//! A [`CacheItemSet`] moves through `Uninitialized -> Loading -> Ready`.
//! Only the caller that wins the compare-and-swap into `Loading` runs the
//! backing load; everyone else waits for the outcome. A `Ready` set whose
//! period has elapsed reports [`LoadState::Stale`] and can be claimed for a
//! reload the same way.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

const UNINITIALIZED: u8 = 0;
const LOADING: u8 = 1;
const READY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Uninitialized,
    Loading,
    Ready,
    /// Ready, but older than the configured period.
    Stale,
}

/// What a caller does when another caller is already loading the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    /// Wait for the in-flight load and share its result.
    #[default]
    Wait,
    /// Fail immediately with a load error.
    FailFast,
}

#[derive(Debug)]
pub struct CacheItemSet {
    key: String,
    state: AtomicU8,
    loaded_at: Mutex<Option<Instant>>,
    period: Option<Duration>,
    notify: Notify,
}

impl CacheItemSet {
    pub fn new(key: impl Into<String>, period: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            state: AtomicU8::new(UNINITIALIZED),
            loaded_at: Mutex::new(None),
            period,
            notify: Notify::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> LoadState {
        match self.state.load(Ordering::Acquire) {
            LOADING => LoadState::Loading,
            READY if self.is_expired() => LoadState::Stale,
            READY => LoadState::Ready,
            _ => LoadState::Uninitialized,
        }
    }

    /// Ready and within its period.
    pub fn is_fresh(&self) -> bool {
        self.state() == LoadState::Ready
    }

    pub fn loaded_at(&self) -> Option<Instant> {
        *self.loaded_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self) -> bool {
        match (self.period, self.loaded_at()) {
            (Some(period), Some(at)) => at.elapsed() > period,
            _ => false,
        }
    }

    /// Claims the load. Returns `true` for exactly one caller while the set
    /// is uninitialized or stale.
    pub fn try_begin_load(&self) -> bool {
        if self
            .state
            .compare_exchange(UNINITIALIZED, LOADING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }
        self.is_expired()
            && self
                .state
                .compare_exchange(READY, LOADING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn on_load_success(&self) {
        *self.loaded_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.state.store(READY, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Reverts to `Uninitialized` so the next access retries.
    pub fn on_load_failure(&self) {
        self.state.store(UNINITIALIZED, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Waits until no load is in flight and returns the resulting state.
    pub async fn wait_for_load(&self) -> LoadState {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so a completion in between is not
            // missed.
            notified.as_mut().enable();
            let state = self.state();
            if state != LoadState::Loading {
                return state;
            }
            notified.await;
        }
    }
}

/// Marks a claimed load failed unless it was completed, so a cancelled
/// loader never leaves the set stuck in `Loading`.
pub(crate) struct LoadGuard<'a> {
    set: &'a CacheItemSet,
    done: bool,
}

impl<'a> LoadGuard<'a> {
    pub(crate) fn new(set: &'a CacheItemSet) -> Self {
        Self { set, done: false }
    }

    pub(crate) fn succeed(mut self) {
        self.done = true;
        self.set.on_load_success();
    }

    pub(crate) fn fail(mut self) {
        self.done = true;
        self.set.on_load_failure();
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(key = %self.set.key(), "Rank load abandoned");
            self.set.on_load_failure();
        }
    }
}
