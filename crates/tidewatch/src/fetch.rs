//! The resilient fetch wrapper every upstream call goes through: cache check, then the
//! producer under retry/backoff, then a TTL-bounded insert on success.

use crate::{
    cache::{CacheEntry, TtlCache},
    config::FetchConfig,
    errors::FetchError,
    retry::{retry_with_backoff, BackoffConfig},
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct ResilientFetcher {
    cache: TtlCache,
    backoff: BackoffConfig,
    /// TTL for descriptive, slow-changing data (token metadata, reserve lists).
    pub static_ttl: Duration,
    /// TTL for balances and prices.
    pub volatile_ttl: Duration,
}

impl ResilientFetcher {
    pub fn new(backoff: BackoffConfig, max_entries: usize) -> Self {
        Self {
            cache: TtlCache::new(max_entries),
            backoff,
            static_ttl: Duration::from_secs(300),
            volatile_ttl: Duration::from_secs(30),
        }
    }

    pub fn from_config(cfg: &FetchConfig) -> Self {
        let mut f = Self::new(cfg.backoff(), cfg.cache_max_entries);
        f.static_ttl = Duration::from_secs(cfg.static_ttl_seconds);
        f.volatile_ttl = Duration::from_secs(cfg.volatile_ttl_seconds);
        f
    }

    /// Return the live cached value for `key`, or run `producer` under the retry policy and
    /// cache its result for `ttl`.
    ///
    /// Concurrent calls with the same key wait for the in-flight producer and then read its
    /// cached result, so the producer runs at most once per key per TTL window. Failures are
    /// never cached.
    pub async fn fetch<T, F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<T, FetchError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, FetchError>> + Send,
    {
        let slot = self.cache.slot(key);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref() {
            if entry.is_live(Instant::now()) {
                if let Some(v) = entry.payload.downcast_ref::<T>() {
                    debug!(key, "cache hit");
                    return Ok(v.clone());
                }
            }
        }
        // Expired (or a different type under the same key): never hand it out.
        *guard = None;

        let mut producer = producer;
        let v = retry_with_backoff(&self.backoff, |_| producer(), key).await?;
        *guard = Some(CacheEntry::new(Arc::new(v.clone()), ttl));
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fetcher() -> ResilientFetcher {
        ResilientFetcher::new(BackoffConfig::immediate(3), 128)
    }

    #[tokio::test]
    async fn second_fetch_within_ttl_hits_cache() -> eyre::Result<()> {
        let f = fetcher();
        let calls = AtomicUsize::new(0);
        for _ in 0_u8..2_u8 {
            let v = f
                .fetch("k", Duration::from_secs(60), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, FetchError>(7_u64) }
                })
                .await?;
            assert_eq!(v, 7_u64);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1_usize, "producer ran more than once");
        Ok(())
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() -> eyre::Result<()> {
        let f = fetcher();
        let calls = AtomicUsize::new(0);
        let produce = || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, FetchError>(n) }
        };
        let first = f.fetch("k", Duration::from_millis(5), produce).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = f.fetch("k", Duration::from_millis(5), produce).await?;
        assert_eq!(first, 0_usize);
        assert_eq!(second, 1_usize, "stale value returned after expiry");
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_retried_and_not_cached() -> eyre::Result<()> {
        let f = fetcher();
        let calls = AtomicUsize::new(0);
        let res: Result<u8, FetchError> = f
            .fetch("k", Duration::from_secs(60), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Transport("down".into())) }
            })
            .await;
        assert!(res.is_err(), "expected failure");
        assert_eq!(calls.load(Ordering::SeqCst), 3_usize, "should exhaust 3 attempts");

        let v = f
            .fetch("k", Duration::from_secs(60), || async { Ok::<_, FetchError>(1_u8) })
            .await?;
        assert_eq!(v, 1_u8);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_producer_call() -> eyre::Result<()> {
        let f = Arc::new(fetcher());
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |f: Arc<ResilientFetcher>, calls: Arc<AtomicUsize>| async move {
            f.fetch("balance:ethereum:0xabc:native", Duration::from_secs(30), || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, FetchError>(String::from("1000"))
                }
            })
            .await
        };

        let (a, b) = tokio::join!(
            run(Arc::clone(&f), Arc::clone(&calls)),
            run(Arc::clone(&f), Arc::clone(&calls))
        );
        assert_eq!(a?, "1000");
        assert_eq!(b?, "1000");
        assert_eq!(calls.load(Ordering::SeqCst), 1_usize, "upstream fetched twice");
        Ok(())
    }
}
