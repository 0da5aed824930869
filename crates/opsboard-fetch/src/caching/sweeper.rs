//! Periodic purge of expired cache entries.
//!
//! Read-triggered expiry only covers keys that are read again; entries that
//! are written once and never re-read would otherwise sit in the cache until
//! capacity eviction happens to reach them. The sweeper bounds that memory
//! independent of read access.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use serde_json::Value;

use super::MemoryCache;

/// Spawns the maintenance sweeper task.
///
/// Every `interval` the sweeper removes all entries whose TTL has elapsed.
/// A failing pass is logged and skipped; the only acceptable failure mode
/// is "try again next interval", never taking the host process down. The
/// caller owns the returned handle and aborts it on shutdown.
pub fn spawn(cache: MemoryCache<Value>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can be expired yet.
        interval.tick().await;

        loop {
            interval.tick().await;

            // A panic here (a poisoned cache lock, for instance) must not
            // kill the sweep loop.
            match std::panic::catch_unwind(AssertUnwindSafe(|| cache.purge_expired())) {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::debug!(removed, "Swept expired cache entries");
                    metric!(counter("cache.swept") += removed as i64);
                }
                Err(_) => {
                    tracing::error!("Cache sweep failed, retrying next interval");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::CacheKey;

    #[tokio::test]
    async fn test_sweeper_purges_without_reads() {
        let cache: MemoryCache<Value> = MemoryCache::new(10);
        cache.set(
            CacheKey::custom("users:all"),
            Value::Null,
            Duration::from_millis(50),
        );
        let sweeper = spawn(cache.clone(), Duration::from_millis(100));

        // Entry still present before the TTL has elapsed.
        assert_eq!(cache.len(), 1);

        // One sweep interval later the expired entry is gone, despite the
        // key never being read.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(cache.len(), 0);

        sweeper.abort();
    }
}
