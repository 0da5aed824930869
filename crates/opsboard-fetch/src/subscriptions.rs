//! Lifecycle management for change-notification subscriptions.
//!
//! Live-update channels are a scarce, leak-prone resource: every watched
//! resource holds a server-side stream open. This module keeps the set of
//! open subscriptions bounded. When the pool is full, the earliest-created
//! subscription is forcibly closed to make room — FIFO by creation order,
//! deliberately NOT least-recently-used. That can tear down a subscription
//! that is still in active use; the application re-subscribes on the next
//! render pass. Keeping the policy predictable was chosen over keeping it
//! clever, and it must not be changed to LRU without revisiting every
//! caller that relies on re-subscribe semantics.
//!
//! The engine does not own the wire protocol. Delivering payloads for a
//! channel is the job of the [`NotificationTransport`] collaborator; the
//! pool only does slot bookkeeping and guarantees it never exceeds its
//! capacity.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::activity::{ActivityEvent, ActivityKind, ActivityLog};

/// Invoked by the transport with the payload of each change notification.
pub type NotificationCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// The transport that delivers change notifications for a channel.
///
/// `open` may be called repeatedly with the same channel string; every call
/// yields an independent subscription.
pub trait NotificationTransport: Send + Sync {
    fn open(
        &self,
        channel: &str,
        on_change: NotificationCallback,
    ) -> Box<dyn TransportSubscription>;
}

/// A live transport-level subscription.
///
/// `unsubscribe` must always be safe to call, even after the underlying
/// connection has already dropped.
pub trait TransportSubscription: Send {
    fn unsubscribe(self: Box<Self>);
}

/// One pool slot: `absent → open → closed`.
///
/// `closed` is terminal for the slot; the channel name may come back in a
/// new slot later.
struct Slot {
    channel: String,
    subscription: Box<dyn TransportSubscription>,
}

#[derive(Default)]
struct Inner {
    /// Open slots keyed by creation index; iteration order is creation order.
    slots: BTreeMap<u64, Slot>,
    next_index: u64,
}

/// A bounded registry of open change-notification subscriptions.
pub struct SubscriptionPool {
    inner: Arc<Mutex<Inner>>,
    max_active: usize,
    activity: ActivityLog,
}

impl Clone for SubscriptionPool {
    fn clone(&self) -> Self {
        SubscriptionPool {
            inner: Arc::clone(&self.inner),
            max_active: self.max_active,
            activity: self.activity.clone(),
        }
    }
}

impl SubscriptionPool {
    pub fn new(max_active: usize, activity: ActivityLog) -> Self {
        SubscriptionPool {
            inner: Arc::new(Mutex::new(Inner::default())),
            max_active,
            activity,
        }
    }

    /// Opens a subscription for `channel`, evicting the earliest-created one
    /// if the pool is full.
    ///
    /// Channels are not unique: subscribing the same channel twice opens two
    /// independent slots.
    pub fn subscribe(
        &self,
        transport: &dyn NotificationTransport,
        channel: &str,
        on_change: NotificationCallback,
    ) -> SubscriptionHandle {
        let subscription = transport.open(channel, on_change);

        let (index, evicted) = {
            let mut inner = self.inner.lock().unwrap();
            let index = inner.next_index;
            inner.next_index += 1;
            inner.slots.insert(
                index,
                Slot {
                    channel: channel.to_owned(),
                    subscription,
                },
            );

            let evicted = if inner.slots.len() > self.max_active {
                inner.slots.pop_first().map(|(_, slot)| slot)
            } else {
                None
            };
            metric!(gauge("subscriptions.active") = inner.slots.len() as u64);
            (index, evicted)
        };

        if let Some(slot) = evicted {
            tracing::debug!(
                channel = %slot.channel,
                "Subscription pool full, evicting earliest subscription"
            );
            metric!(counter("subscriptions.evicted") += 1);
            self.close_slot(slot, "evicted");
        }

        self.activity.record(ActivityEvent::new(
            ActivityKind::SubscriptionOpen,
            format!("subscribed {channel}"),
        ));

        SubscriptionHandle {
            pool: self.clone(),
            index,
        }
    }

    /// Closes every open subscription for `channel`.
    pub fn unsubscribe(&self, channel: &str) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let indices: Vec<u64> = inner
                .slots
                .iter()
                .filter(|(_, slot)| slot.channel == channel)
                .map(|(index, _)| *index)
                .collect();
            let removed: Vec<Slot> = indices
                .into_iter()
                .filter_map(|index| inner.slots.remove(&index))
                .collect();
            metric!(gauge("subscriptions.active") = inner.slots.len() as u64);
            removed
        };

        for slot in removed {
            self.close_slot(slot, "explicit");
        }
    }

    /// Closes every open subscription.
    pub fn unsubscribe_all(&self) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let slots = std::mem::take(&mut inner.slots);
            metric!(gauge("subscriptions.active") = 0);
            slots
        };

        for (_, slot) in removed {
            self.close_slot(slot, "teardown");
        }
    }

    /// The channels of all open subscriptions, in creation order.
    pub fn active_channels(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.slots.values().map(|slot| slot.channel.clone()).collect()
    }

    /// The number of open subscriptions.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close_slot(&self, slot: Slot, reason: &str) {
        self.activity.record(ActivityEvent::new(
            ActivityKind::SubscriptionClose,
            format!("unsubscribed {} ({reason})", slot.channel),
        ));
        slot.subscription.unsubscribe();
    }

    fn remove_index(&self, index: u64) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let removed = inner.slots.remove(&index);
            metric!(gauge("subscriptions.active") = inner.slots.len() as u64);
            removed
        };

        if let Some(slot) = removed {
            self.close_slot(slot, "explicit");
        }
    }
}

/// Owner handle for one pool slot.
pub struct SubscriptionHandle {
    pool: SubscriptionPool,
    index: u64,
}

impl SubscriptionHandle {
    /// Closes exactly this handle's slot.
    ///
    /// Calling it again, or after the slot was evicted, is a no-op.
    pub fn unsubscribe(&self) {
        self.pool.remove_index(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::test::RecordingTransport;

    fn pool(max_active: usize) -> SubscriptionPool {
        let activity = ActivityLog::new(1000, Duration::from_secs(3600));
        SubscriptionPool::new(max_active, activity)
    }

    fn noop() -> NotificationCallback {
        Arc::new(|_payload| {})
    }

    #[test]
    fn test_pool_bound_evicts_earliest() {
        let transport = RecordingTransport::new();
        let pool = pool(10);

        for i in 0..10 {
            pool.subscribe(&transport, &format!("projects:{i}"), noop());
        }
        assert_eq!(pool.len(), 10);

        pool.subscribe(&transport, "invoices:7", noop());

        assert_eq!(pool.len(), 10);
        // The first-created subscription was forced out and closed.
        assert_eq!(transport.closed(), vec!["projects:0".to_owned()]);
        assert!(!pool.active_channels().contains(&"projects:0".to_owned()));
        assert!(pool.active_channels().contains(&"invoices:7".to_owned()));
    }

    #[test]
    fn test_handle_unsubscribe_is_idempotent() {
        let transport = RecordingTransport::new();
        let pool = pool(10);

        let handle = pool.subscribe(&transport, "users:1", noop());
        pool.subscribe(&transport, "users:2", noop());

        handle.unsubscribe();
        handle.unsubscribe();

        assert_eq!(pool.len(), 1);
        assert_eq!(transport.closed(), vec!["users:1".to_owned()]);
        assert_eq!(pool.active_channels(), vec!["users:2".to_owned()]);
    }

    #[test]
    fn test_same_channel_occupies_two_slots() {
        let transport = RecordingTransport::new();
        let pool = pool(10);

        pool.subscribe(&transport, "users:1", noop());
        pool.subscribe(&transport, "users:1", noop());

        assert_eq!(pool.len(), 2);
        assert_eq!(transport.opened(), vec!["users:1".to_owned(), "users:1".to_owned()]);

        // Channel-level unsubscribe tears down both slots.
        pool.unsubscribe("users:1");
        assert!(pool.is_empty());
        assert_eq!(transport.closed().len(), 2);
    }

    #[test]
    fn test_unsubscribe_all() {
        let transport = RecordingTransport::new();
        let pool = pool(10);

        pool.subscribe(&transport, "users:1", noop());
        pool.subscribe(&transport, "projects:1", noop());

        pool.unsubscribe_all();

        assert!(pool.is_empty());
        assert_eq!(pool.active_channels(), Vec::<String>::new());
        assert_eq!(transport.closed().len(), 2);
    }

    #[test]
    fn test_callback_receives_notifications() {
        let transport = RecordingTransport::new();
        let pool = pool(10);

        let received = Arc::new(Mutex::new(Vec::new()));
        let callback: NotificationCallback = {
            let received = Arc::clone(&received);
            Arc::new(move |payload| received.lock().unwrap().push(payload))
        };

        pool.subscribe(&transport, "tickets:42", callback);
        transport.notify("tickets:42", serde_json::json!({"status": "closed"}));

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["status"], "closed");
    }
}
