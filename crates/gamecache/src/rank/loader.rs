use std::future::Future;

use async_trait::async_trait;

/// Fetches a leaderboard's rows from the system of record.
///
/// Errors are reported to the caller of
/// [`RankCache::load_on_miss`](super::RankCache::load_on_miss) as
/// [`CacheError::LoadFailure`](gamecache_core::CacheError::LoadFailure).
#[async_trait]
pub trait BackingLoader<T>: Send + Sync {
    async fn load(&self, key: &str) -> anyhow::Result<Vec<T>>;
}

/// Adapts an async closure into a [`BackingLoader`].
pub struct LoaderFn<F>(pub F);

#[async_trait]
impl<T, F, Fut> BackingLoader<T> for LoaderFn<F>
where
    T: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<T>>> + Send + 'static,
{
    async fn load(&self, key: &str) -> anyhow::Result<Vec<T>> {
        (self.0)(key.to_string()).await
    }
}
