//! Caller-side invocation rate limiting.
//!
//! These helpers do not belong to the fetch pipeline; they are offered to
//! application code that wants to tame chatty UI event sources (search
//! boxes, resize observers) before a fetch is even issued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Runs a callback once a burst of calls has gone quiet.
///
/// Every [`call`](Self::call) re-arms the timer: the callback runs `wait`
/// after the most recent call, so a burst collapses into one invocation.
pub struct Debounce<F> {
    f: Arc<F>,
    wait: Duration,
    generation: Arc<AtomicU64>,
}

impl<F> Debounce<F>
where
    F: Fn() + Send + Sync + 'static,
{
    pub fn new(wait: Duration, f: F) -> Self {
        Debounce {
            f: Arc::new(f),
            wait,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Schedules the callback, superseding any pending schedule.
    ///
    /// Must be called from within a tokio runtime.
    pub fn call(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let latest = Arc::clone(&self.generation);
        let f = Arc::clone(&self.f);
        let wait = self.wait;

        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            // Only the most recent call of the burst fires.
            if latest.load(Ordering::SeqCst) == generation {
                f();
            }
        });
    }
}

/// Runs a callback at most once per time window.
pub struct Throttle<F> {
    f: F,
    limit: Duration,
    last_fired: Mutex<Option<Instant>>,
}

impl<F: Fn()> Throttle<F> {
    pub fn new(limit: Duration, f: F) -> Self {
        Throttle {
            f,
            limit,
            last_fired: Mutex::new(None),
        }
    }

    /// Invokes the callback unless it already fired within the window.
    ///
    /// Returns whether the callback fired.
    pub fn call(&self) -> bool {
        {
            let mut last_fired = self.last_fired.lock().unwrap();
            let now = Instant::now();
            if let Some(fired) = *last_fired {
                if now.duration_since(fired) < self.limit {
                    return false;
                }
            }
            *last_fired = Some(now);
        }

        (self.f)();
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_debounce_collapses_bursts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let debounce = {
            let calls = Arc::clone(&calls);
            Debounce::new(Duration::from_millis(30), move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        debounce.call();
        debounce.call();
        debounce.call();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A later call after the quiet period fires again.
        debounce.call();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_throttle_limits_rate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let throttle = {
            let calls = Arc::clone(&calls);
            Throttle::new(Duration::from_millis(30), move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(throttle.call());
        assert!(!throttle.call());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        std::thread::sleep(Duration::from_millis(50));
        assert!(throttle.call());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
