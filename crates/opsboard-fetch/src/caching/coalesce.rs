use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared, TryFutureExt};

use crate::utils::defer::CallOnDrop;

use super::{CacheKey, FetchError, FetchResult};

type ComputationChannel<T> = Shared<oneshot::Receiver<FetchResult<T>>>;
type ComputationMap<T> = Arc<Mutex<BTreeMap<CacheKey, ComputationChannel<T>>>>;

/// Collapses concurrent fetches for the same key into a single producer run.
///
/// The first caller for a key spawns the producer as a task and registers a
/// shareable channel for its outcome; every further caller arriving before
/// settlement is handed the same channel. The registry entry is removed when
/// the producer settles, so the next caller after that starts a fresh run.
///
/// Because producers are spawned eagerly, they run to completion even if all
/// interested callers are dropped; there is no caller-initiated cancellation.
pub struct Coalescer<T> {
    /// Used for deduplicating in-flight fetches.
    current_computations: ComputationMap<T>,
}

impl<T> std::fmt::Debug for Coalescer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let in_flight = self
            .current_computations
            .try_lock()
            .map(|computations| computations.len())
            .unwrap_or_default();
        f.debug_struct("Coalescer")
            .field("in flight", &in_flight)
            .finish()
    }
}

impl<T> Clone for Coalescer<T> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Coalescer {
            current_computations: Arc::clone(&self.current_computations),
        }
    }
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self {
        Coalescer {
            current_computations: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Coalescer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the producer unless one is already in flight for `key`.
    ///
    /// Returns a future for the single shared outcome, and whether this
    /// caller was attached to an already running producer. The producer
    /// closure is only invoked when a new flight starts; coalesced callers
    /// never touch theirs. The outcome is delivered identically to every
    /// attached caller, value or error.
    pub fn spawn<F, Fut>(&self, key: CacheKey, producer: F) -> (BoxFuture<'static, FetchResult<T>>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let (channel, coalesced) = {
            let mut current_computations = self.current_computations.lock().unwrap();
            if let Some(channel) = current_computations.get(&key) {
                (channel.clone(), true)
            } else {
                let channel = self.create_channel(key.clone(), producer());
                let evicted = current_computations.insert(key, channel.clone());
                debug_assert!(evicted.is_none());
                (channel, false)
            }
        };

        // The sender is dropped without sending only if the producer task
        // died before settling, which is an engine bug.
        let future = channel.unwrap_or_else(|_canceled| Err(FetchError::Internal));

        (Box::pin(future), coalesced)
    }

    /// Creates a shareable channel that runs the computation as a task.
    fn create_channel<F>(&self, key: CacheKey, computation: F) -> ComputationChannel<T>
    where
        F: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let current_computations = Arc::clone(&self.current_computations);
        let remove_computation_token = CallOnDrop::new(move || {
            current_computations.lock().unwrap().remove(&key);
        });

        let channel = async move {
            let result = computation.await;
            // Drop the token first to evict from the map. This ensures that
            // callers either get a channel that will receive data, or they
            // create a new channel.
            drop(remove_computation_token);
            sender.send(result).ok();
        };

        tokio::spawn(channel);

        receiver.shared()
    }

    /// The number of producers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.current_computations.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn key(raw: &str) -> CacheKey {
        CacheKey::custom(raw)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let coalescer = Coalescer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut futures = Vec::new();
        let mut coalesced_count = 0;
        for _ in 0..10 {
            let runs = Arc::clone(&runs);
            let (future, coalesced) = coalescer.spawn(key("users:all"), || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(42)
            });
            if coalesced {
                coalesced_count += 1;
            }
            futures.push(future);
        }

        for future in futures {
            assert_eq!(future.await, Ok(42));
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(coalesced_count, 9);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_fans_out_and_is_not_sticky() {
        let coalescer = Coalescer::new();

        let (first, _) = coalescer.spawn(key("users:all"), || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<i32, _>(FetchError::Fetch("boom".into()))
        });
        let (second, coalesced) = coalescer.spawn(key("users:all"), || async { Ok(1) });
        assert!(coalesced);

        assert_eq!(first.await, Err(FetchError::Fetch("boom".into())));
        assert_eq!(second.await, Err(FetchError::Fetch("boom".into())));

        // After settlement the registry is empty and a new run starts fresh.
        assert_eq!(coalescer.in_flight(), 0);
        let (third, coalesced) = coalescer.spawn(key("users:all"), || async { Ok(1) });
        assert!(!coalesced);
        assert_eq!(third.await, Ok(1));
    }

    #[tokio::test]
    async fn test_independent_keys_run_independently() {
        let coalescer = Coalescer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for name in ["users:1", "users:2"] {
            let runs = Arc::clone(&runs);
            let (future, coalesced) = coalescer.spawn(key(name), || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            });
            assert!(!coalesced);
            assert_eq!(future.await, Ok(0));
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
