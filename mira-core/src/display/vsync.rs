//! Shared display-refresh driver.
//!
//! One underlying ticker is shared by all render surfaces: consumers
//! register a callback and get back a [`VsyncHandle`]. The ticker task
//! is created when the first consumer registers and torn down when the
//! last one unregisters. Handles unregister on drop, so a consumer that
//! disappears without cleaning up cannot leak the driver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Default refresh cadence (60 Hz).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_micros(16_667);

type TickCallback = Arc<dyn Fn() + Send + Sync>;

struct RegistryInner {
    callbacks: HashMap<u64, TickCallback>,
    next_id: u64,
    ticker: Option<JoinHandle<()>>,
}

/// Registry owning the single refresh-driver task.
///
/// Cloning shares the same underlying driver. Registration must happen
/// inside a Tokio runtime (the ticker is a spawned task).
#[derive(Clone)]
pub struct VsyncRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    interval: Duration,
}

impl VsyncRegistry {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_REFRESH_INTERVAL)
    }

    /// Registry with an explicit refresh interval (tests, non-60Hz
    /// displays).
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                callbacks: HashMap::new(),
                next_id: 1,
                ticker: None,
            })),
            interval,
        }
    }

    /// Register a per-refresh callback. The first registration starts
    /// the shared ticker.
    pub fn register(&self, callback: impl Fn() + Send + Sync + 'static) -> VsyncHandle {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.callbacks.insert(id, Arc::new(callback));

        if inner.ticker.is_none() {
            debug!(interval = ?self.interval, "starting refresh driver");
            inner.ticker = Some(self.spawn_ticker());
        }

        VsyncHandle {
            id,
            registry: self.inner.clone(),
        }
    }

    /// Number of registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().unwrap().callbacks.len()
    }

    /// Whether the underlying ticker task currently exists.
    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().ticker.is_some()
    }

    fn spawn_ticker(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // Snapshot under the lock, invoke outside it.
                let callbacks: Vec<TickCallback> =
                    inner.lock().unwrap().callbacks.values().cloned().collect();
                for callback in callbacks {
                    callback();
                }
            }
        })
    }
}

impl Default for VsyncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration handle. Dropping it unregisters the callback; when the
/// last consumer goes away the shared ticker is stopped.
pub struct VsyncHandle {
    id: u64,
    registry: Arc<Mutex<RegistryInner>>,
}

impl VsyncHandle {
    /// Explicit unregistration (equivalent to dropping the handle).
    pub fn unregister(self) {}
}

impl Drop for VsyncHandle {
    fn drop(&mut self) {
        let mut inner = self.registry.lock().unwrap();
        inner.callbacks.remove(&self.id);
        if inner.callbacks.is_empty() {
            if let Some(ticker) = inner.ticker.take() {
                debug!("last consumer gone, stopping refresh driver");
                ticker.abort();
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn ticks_registered_callback() {
        let registry = VsyncRegistry::with_interval(Duration::from_millis(1));
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = registry.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        drop(handle);
    }

    #[tokio::test]
    async fn ticker_lifecycle_follows_registrations() {
        let registry = VsyncRegistry::with_interval(Duration::from_millis(1));
        assert!(!registry.is_running());

        let a = registry.register(|| {});
        let b = registry.register(|| {});
        assert!(registry.is_running());
        assert_eq!(registry.consumer_count(), 2);

        drop(a);
        assert!(registry.is_running());

        drop(b);
        assert!(!registry.is_running());
        assert_eq!(registry.consumer_count(), 0);
    }

    #[tokio::test]
    async fn restart_after_full_teardown() {
        let registry = VsyncRegistry::with_interval(Duration::from_millis(1));
        let first = registry.register(|| {});
        drop(first);
        assert!(!registry.is_running());

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let second = registry.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.is_running());
        assert!(ticks.load(Ordering::SeqCst) >= 1);
        drop(second);
    }
}
