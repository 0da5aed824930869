//! The composition root of the engine.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::activity::{ActivityEvent, ActivityKind, ActivityLog, ActivityStats};
use crate::caching::{
    FetchOptions, FetchResult, Fetcher, MemoryCache, Params, StatsSnapshot, sweeper,
};
use crate::config::Config;
use crate::subscriptions::{
    NotificationCallback, NotificationTransport, SubscriptionHandle, SubscriptionPool,
};

/// A combined point-in-time report over all engine structures.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub fetch: StatsSnapshot,
    pub cache_entries: usize,
    pub in_flight: usize,
    pub active_subscriptions: usize,
    pub activity: ActivityStats,
}

/// The engine behind all Opsboard data access.
///
/// Owns every shared structure — cache, pending-fetch registry,
/// subscription pool, activity log. They are constructed here and handed
/// around by reference, never as module-level globals, so tests and
/// embedders can run any number of independent engines in one process.
///
/// Logging and metrics are process-global and therefore NOT initialized
/// here; hosts call [`logging::init`](crate::logging::init) and
/// [`metrics::configure_statsd`](crate::metrics::configure_statsd) once at
/// startup.
pub struct FetchService {
    fetcher: Fetcher,
    subscriptions: SubscriptionPool,
    activity: ActivityLog,
    transport: Arc<dyn NotificationTransport>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl FetchService {
    /// Creates the engine and spawns its maintenance sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(config: Config, transport: Arc<dyn NotificationTransport>) -> Result<Self> {
        anyhow::ensure!(config.cache.capacity > 0, "cache capacity must be non-zero");
        anyhow::ensure!(
            config.subscriptions.max_active > 0,
            "subscription limit must be non-zero"
        );

        let activity = ActivityLog::new(config.activity.max_events, config.activity.stats_window);
        let cache = MemoryCache::new(config.cache.capacity);
        let fetcher = Fetcher::new(cache.clone(), activity.clone(), config.cache.default_ttl);
        let subscriptions =
            SubscriptionPool::new(config.subscriptions.max_active, activity.clone());
        let sweeper = sweeper::spawn(cache, config.cache.sweep_interval);

        Ok(FetchService {
            fetcher,
            subscriptions,
            activity,
            transport,
            sweeper,
        })
    }

    /// See [`Fetcher::cached_fetch`].
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
        self.fetcher.cached_fetch(operation, params, producer).await
    }

    /// See [`Fetcher::cached_fetch_with`].
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
        self.fetcher
            .cached_fetch_with(operation, params, options, producer)
            .await
    }

    /// Removes cached entries: all of them, or those whose key starts with
    /// `prefix`.
    pub fn invalidate(&self, prefix: Option<&str>) -> usize {
        self.fetcher.invalidate(prefix)
    }

    /// Opens a change-notification subscription on the configured transport.
    pub fn subscribe(&self, channel: &str, on_change: NotificationCallback) -> SubscriptionHandle {
        self.subscriptions
            .subscribe(self.transport.as_ref(), channel, on_change)
    }

    /// Closes every open subscription for `channel`.
    pub fn unsubscribe(&self, channel: &str) {
        self.subscriptions.unsubscribe(channel);
    }

    /// Closes every open subscription.
    pub fn unsubscribe_all(&self) {
        self.subscriptions.unsubscribe_all();
    }

    /// The channels of all open subscriptions, in creation order.
    pub fn active_channels(&self) -> Vec<String> {
        self.subscriptions.active_channels()
    }

    /// Records an application-level event into the activity log.
    pub fn record_user_action(&self, description: impl Into<String>) {
        self.activity
            .record(ActivityEvent::new(ActivityKind::UserAction, description));
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            fetch: self.fetcher.stats(),
            cache_entries: self.fetcher.cache().len(),
            in_flight: self.fetcher.in_flight(),
            active_subscriptions: self.subscriptions.len(),
            activity: self.activity.stats(),
        }
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }
}

impl Drop for FetchService {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::test::{self, RecordingTransport};

    use super::*;

    fn service(transport: Arc<RecordingTransport>) -> FetchService {
        FetchService::create(Config::default(), transport).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_wiring() {
        test::setup();
        let transport = Arc::new(RecordingTransport::new());
        let service = service(Arc::clone(&transport));

        let value = service
            .cached_fetch("users.list", &Params::new(), || async {
                Ok(json!([{"id": 1}]))
            })
            .await
            .unwrap();
        assert_eq!(value, json!([{"id": 1}]));

        let handle = service.subscribe("users", Arc::new(|_payload| {}));
        assert_eq!(service.active_channels(), vec!["users".to_owned()]);
        service.record_user_action("opened dashboard");

        let stats = service.stats();
        assert_eq!(stats.fetch.total_requests, 1);
        assert_eq!(stats.fetch.cache_misses, 1);
        assert_eq!(stats.cache_entries, 1);
        assert_eq!(stats.active_subscriptions, 1);
        assert_eq!(stats.activity.by_kind[&ActivityKind::UserAction], 1);

        handle.unsubscribe();
        assert_eq!(transport.closed(), vec!["users".to_owned()]);
    }

    #[tokio::test]
    async fn test_invalidation_forces_refetch() {
        test::setup();
        let transport = Arc::new(RecordingTransport::new());
        let service = service(transport);

        for _ in 0..2 {
            service
                .cached_fetch("projects.list", &Params::new(), || async { Ok(json!([])) })
                .await
                .unwrap();
        }
        let stats = service.stats();
        assert_eq!(stats.fetch.cache_hits, 1);

        assert_eq!(service.invalidate(Some("projects.list:")), 1);

        service
            .cached_fetch("projects.list", &Params::new(), || async { Ok(json!([])) })
            .await
            .unwrap();
        let stats = service.stats();
        assert_eq!(stats.fetch.cache_misses, 2);
    }

    #[tokio::test]
    async fn test_rejects_degenerate_config() {
        let mut config = Config::default();
        config.cache.capacity = 0;
        let transport = Arc::new(RecordingTransport::new());
        assert!(FetchService::create(config, transport).is_err());
    }
}
