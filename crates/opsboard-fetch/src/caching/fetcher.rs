use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::activity::{ActivityEvent, ActivityKind, ActivityLog};

use super::{CacheKey, Coalescer, FetchResult, MemoryCache, Params};

/// Per-call overrides for [`Fetcher::cached_fetch_with`].
#[derive(Debug, Default)]
pub struct FetchOptions {
    /// Replaces the key derived from operation and parameters.
    pub cache_key: Option<CacheKey>,
    /// Replaces the configured default TTL.
    pub ttl: Option<Duration>,
}

/// Process-lifetime fetch counters.
///
/// These run for as long as the process does and are reset only by restart;
/// the sliding-window activity statistics are derived separately by the
/// [`ActivityLog`].
#[derive(Debug, Default)]
pub struct FetchStats {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    deduplicated: AtomicU64,
    response_time_micros: AtomicU64,
    responses: AtomicU64,
}

impl FetchStats {
    fn record_response_time(&self, duration: Duration) {
        self.response_time_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let responses = self.responses.load(Ordering::Relaxed);
        let avg_response_time = (responses > 0).then(|| {
            Duration::from_micros(self.response_time_micros.load(Ordering::Relaxed) / responses)
        });

        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            avg_response_time,
        }
    }
}

/// A point-in-time view of the [`FetchStats`] counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub deduplicated: u64,
    /// Mean producer duration over all successful fetches.
    pub avg_response_time: Option<Duration>,
}

/// The fetch pipeline: cache lookup, coalesced producer run, write-back.
///
/// See the [module docs](crate::caching) for the flow of a fetch through
/// the layers.
#[derive(Debug)]
pub struct Fetcher {
    cache: MemoryCache<Value>,
    coalescer: Coalescer<Value>,
    activity: ActivityLog,
    stats: Arc<FetchStats>,
    default_ttl: Duration,
}

impl Clone for Fetcher {
    fn clone(&self) -> Self {
        Fetcher {
            cache: self.cache.clone(),
            coalescer: self.coalescer.clone(),
            activity: self.activity.clone(),
            stats: Arc::clone(&self.stats),
            default_ttl: self.default_ttl,
        }
    }
}

impl Fetcher {
    pub fn new(cache: MemoryCache<Value>, activity: ActivityLog, default_ttl: Duration) -> Self {
        Fetcher {
            cache,
            coalescer: Coalescer::new(),
            activity,
            stats: Arc::new(FetchStats::default()),
            default_ttl,
        }
    }

    /// Fetches the result of `operation` with `params`, served from cache
    /// when possible.
    ///
    /// On a miss the producer runs at most once per key across all
    /// concurrent callers, and only a successful outcome is cached. A
    /// failing producer leaves the cache unchanged and its error is
    /// propagated verbatim; the engine never retries on its own.
    pub async fn cached_fetch<F, Fut>(
        &self,
        operation: &str,
        params: &Params,
        producer: F,
    ) -> FetchResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<Value>> + Send + 'static,
    {
        self.cached_fetch_with(operation, params, FetchOptions::default(), producer)
            .await
    }

    /// Like [`cached_fetch`](Self::cached_fetch), with per-call overrides.
    pub async fn cached_fetch_with<F, Fut>(
        &self,
        operation: &str,
        params: &Params,
        options: FetchOptions,
        producer: F,
    ) -> FetchResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<Value>> + Send + 'static,
    {
        let key = options
            .cache_key
            .unwrap_or_else(|| CacheKey::from_parts(operation, params));

        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        metric!(counter("fetch.access") += 1, "operation" => operation);

        if let Some(value) = self.cache.get(&key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            metric!(counter("fetch.hit") += 1, "operation" => operation);
            self.activity.record(ActivityEvent::new(
                ActivityKind::CacheHit,
                format!("{operation} served from cache"),
            ));
            return Ok(value);
        }

        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        metric!(counter("fetch.miss") += 1, "operation" => operation);
        self.activity.record(ActivityEvent::new(
            ActivityKind::CacheMiss,
            format!("{operation} not cached"),
        ));

        let start = Instant::now();
        let (outcome, coalesced) = self.coalescer.spawn(key.clone(), producer);
        if coalesced {
            self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
            metric!(counter("fetch.coalesced") += 1, "operation" => operation);
            self.activity.record(ActivityEvent::new(
                ActivityKind::Coalesced,
                format!("{operation} joined in-flight fetch"),
            ));
        }

        match outcome.await {
            Ok(value) => {
                let duration = start.elapsed();
                self.cache
                    .set(key, value.clone(), options.ttl.unwrap_or(self.default_ttl));
                self.stats.record_response_time(duration);
                metric!(timer("fetch.duration") = duration, "operation" => operation);
                self.activity.record(
                    ActivityEvent::new(ActivityKind::Query, format!("{operation} fetched"))
                        .with_duration(duration),
                );
                Ok(value)
            }
            Err(err) => {
                metric!(counter("fetch.error") += 1, "operation" => operation);
                self.activity.record(ActivityEvent::new(
                    ActivityKind::Error,
                    format!("{operation} failed: {err}"),
                ));
                Err(err)
            }
        }
    }

    /// Removes cached entries; see [`MemoryCache::invalidate`].
    pub fn invalidate(&self, prefix: Option<&str>) -> usize {
        let removed = self.cache.invalidate(prefix);
        tracing::debug!(removed, prefix, "Invalidated cache entries");
        removed
    }

    pub fn cache(&self) -> &MemoryCache<Value> {
        &self.cache
    }

    /// The number of producers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.coalescer.in_flight()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
