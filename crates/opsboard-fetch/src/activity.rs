//! A rolling record of engine lifecycle events.
//!
//! Everything in here is best-effort observability, never a source of truth:
//! the buffer is bounded and silently drops its oldest events under
//! pressure, and the derived statistics cover a sliding window only, so
//! history resets as entries age out or the process restarts.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// The kind of lifecycle event being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A fetch went through to the backing service.
    Query,
    CacheHit,
    CacheMiss,
    /// A fetch was attached to an already in-flight producer.
    Coalesced,
    SubscriptionOpen,
    SubscriptionClose,
    /// A producer failed.
    Error,
    /// An event reported by the application layer rather than the engine.
    UserAction,
}

/// One recorded lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: ActivityKind,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ActivityEvent {
    pub fn new(kind: ActivityKind, description: impl Into<String>) -> Self {
        ActivityEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            description: description.into(),
            duration: None,
            metadata: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Statistics derived from the recent window of the activity log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivityStats {
    pub total_events: usize,
    pub by_kind: BTreeMap<ActivityKind, usize>,
    /// Mean duration over the events that carry one.
    pub avg_duration: Option<Duration>,
    pub error_count: usize,
}

/// A fixed-capacity ring buffer of engine lifecycle events.
#[derive(Debug)]
pub struct ActivityLog {
    events: Arc<Mutex<VecDeque<ActivityEvent>>>,
    capacity: usize,
    stats_window: Duration,
}

impl Clone for ActivityLog {
    fn clone(&self) -> Self {
        ActivityLog {
            events: Arc::clone(&self.events),
            capacity: self.capacity,
            stats_window: self.stats_window,
        }
    }
}

impl ActivityLog {
    pub fn new(capacity: usize, stats_window: Duration) -> Self {
        ActivityLog {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            stats_window,
        }
    }

    /// Appends an event, dropping the oldest one once at capacity.
    pub fn record(&self, event: ActivityEvent) {
        let mut events = self.events.lock().unwrap();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// All retained events with `start <= timestamp <= end`.
    pub fn events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<ActivityEvent> {
        let events = self.events.lock().unwrap();
        events
            .iter()
            .filter(|event| event.timestamp >= start && event.timestamp <= end)
            .cloned()
            .collect()
    }

    /// All retained events no older than `window`.
    pub fn recent(&self, window: Duration) -> Vec<ActivityEvent> {
        let now = Utc::now();
        let events = self.events.lock().unwrap();
        events
            .iter()
            .filter(|event| within_window(now, event.timestamp, window))
            .cloned()
            .collect()
    }

    /// Statistics over the configured sliding window.
    pub fn stats(&self) -> ActivityStats {
        let recent = self.recent(self.stats_window);

        let mut stats = ActivityStats {
            total_events: recent.len(),
            ..Default::default()
        };

        let mut durations = Vec::new();
        for event in &recent {
            *stats.by_kind.entry(event.kind).or_default() += 1;
            if let Some(duration) = event.duration {
                durations.push(duration);
            }
            if event.kind == ActivityKind::Error {
                stats.error_count += 1;
            }
        }

        if !durations.is_empty() {
            let total: Duration = durations.iter().sum();
            stats.avg_duration = Some(total / durations.len() as u32);
        }

        stats
    }

    /// The number of events currently retained.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether `timestamp` is at most `window` in the past relative to `now`.
///
/// Timestamps in the future (clock skew) are considered inside the window.
fn within_window(now: DateTime<Utc>, timestamp: DateTime<Utc>, window: Duration) -> bool {
    now.signed_duration_since(timestamp)
        .to_std()
        .map_or(true, |age| age <= window)
}
