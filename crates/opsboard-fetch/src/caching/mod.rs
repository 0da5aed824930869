//! # Opsboard caching infrastructure
//!
//! Caching is front and center in this engine. Many browser sessions issue
//! overlapping reads for the same entities concurrently, and every read that
//! reaches the hosted data service costs a round trip. This module contains
//! the layers that absorb that load, our central [`FetchError`] type, and an
//! explanation of how the pieces fit together.
//!
//! ## Layers
//!
//! A fetch goes through the following steps:
//!
//! - First the bounded in-memory cache is consulted ([`MemoryCache`]). A
//!   fresh entry is returned immediately.
//! - On miss the request is handed to the coalescer ([`Coalescer`]), which
//!   guarantees that at most one producer per [`CacheKey`] is in flight at
//!   any instant. Concurrent callers for the same key all receive the single
//!   outcome of that one producer, value or error.
//! - A successful outcome is written back to the cache with its TTL. Errors
//!   are never cached; the next caller after settlement triggers a fresh
//!   producer invocation.
//!
//! Independent of reads, the [`sweeper`] periodically purges entries whose
//! TTL has elapsed, so that keys which are written once and never re-read do
//! not pin memory until eviction.
//!
//! ### Metrics
//!
//! The layers emit the following statsd series:
//!
//! - `fetch.access`: all `cached_fetch` calls.
//! - `fetch.hit` / `fetch.miss`: cache outcome of the lookup step.
//! - `fetch.coalesced`: calls that joined an already in-flight producer.
//! - `fetch.error`: producer failures.
//! - `fetch.duration`: producer duration for successful fetches.
//! - `cache.evicted`: entries displaced by the capacity bound.
//! - `cache.swept`: expired entries removed per sweeper pass.
//!
//! ## [`CacheKey`]
//!
//! The cache key is derived from the operation name and its parameter
//! record. Parameters are serialized canonically (map keys sorted at every
//! nesting level) so that semantically equal records always map to the same
//! key, no matter in which order the caller assembled them.
//!
//! ## [`FetchError`]
//!
//! Producer failures are propagated verbatim to every coalesced waiter and
//! recorded as activity, but never cached: there is no negative caching in
//! this engine. [`FetchError::Internal`] is reserved for engine bugs (a
//! computation channel dropped without settling) and should never be seen
//! by callers in normal operation.

use std::time::Duration;

use thiserror::Error;

mod cache_key;
mod coalesce;
mod fetcher;
mod memory;
pub mod sweeper;

pub use cache_key::{CacheKey, Params, canonical_json};
pub use coalesce::Coalescer;
pub use fetcher::{FetchOptions, FetchStats, Fetcher, StatsSnapshot};
pub use memory::MemoryCache;

/// An error that happens while fetching data from the backing service.
///
/// All variants except [`Internal`](Self::Internal) originate in a
/// caller-supplied producer and are passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The backing data service is not configured or not reachable.
    ///
    /// The attached string contains the producer's description of the
    /// failure. Callers are expected to degrade to empty/default data
    /// rather than surfacing this to the user.
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// The requested entity does not exist upstream.
    #[error("not found")]
    NotFound,
    /// The fetch timed out upstream.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The fetch failed for any other reason reported by the producer.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// An unexpected error in the engine itself.
    ///
    /// This variant is not produced by producers; it signals that an
    /// in-flight computation was lost before settling.
    #[error("internal error")]
    Internal,
}

/// The outcome of a fetch, either a value or the reason it failed.
pub type FetchResult<T> = Result<T, FetchError>;
