//! Refresh-paced consumer for the frame slot.
//!
//! On every refresh tick the scheduler asks the slot to `consume()`.
//! Nothing pending means the tick is a no-op: no callback fires and no
//! frame is re-delivered. At most one image is handed to the delivery
//! callback per refresh, on a dedicated worker task — never on the tick
//! context — so slow delivery can never starve the refresh driver.
//! Callers needing main-thread affinity hop from the worker themselves.
//!
//! The alternative coalesced mode ([`FrameNotifier`]) replaces clock
//! polling with producer wake-ups guarded by a compare-and-swap flag:
//! at most one notification is ever in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::frame::slot::FrameSlot;
use crate::frame::SharedImage;

use super::vsync::{VsyncHandle, VsyncRegistry};

/// Delivery callback invoked on the worker task with each consumed image.
pub type DeliveryFn = Arc<dyn Fn(SharedImage) + Send + Sync>;

// ── PresentationScheduler ────────────────────────────────────────

/// Vsync-driven consumer of a [`FrameSlot`].
pub struct PresentationScheduler {
    slot: Arc<FrameSlot>,
    active: Arc<AtomicBool>,
    vsync: std::sync::Mutex<Option<VsyncHandle>>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PresentationScheduler {
    pub fn new(slot: Arc<FrameSlot>) -> Self {
        Self {
            slot,
            active: Arc::new(AtomicBool::new(false)),
            vsync: std::sync::Mutex::new(None),
            worker: std::sync::Mutex::new(None),
        }
    }

    /// The slot this scheduler drains.
    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    /// Start ticking against the shared refresh driver.
    ///
    /// Each tick consumes at most one image and hands it to `delivery`
    /// through a capacity-1 channel. If the worker is still busy with
    /// the previous image, the slot is left untouched — the image stays
    /// pending and a later push replaces it with a counted skip.
    pub fn start(&self, registry: &VsyncRegistry, delivery: impl Fn(SharedImage) + Send + Sync + 'static) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let delivery: DeliveryFn = Arc::new(delivery);
        let (tx, mut rx) = mpsc::channel::<SharedImage>(1);

        // Worker: final delivery happens here, never on the tick context.
        let worker_active = self.active.clone();
        let worker = tokio::spawn(async move {
            while let Some(image) = rx.recv().await {
                if !worker_active.load(Ordering::SeqCst) {
                    break;
                }
                delivery(image);
            }
        });
        *self.worker.lock().unwrap() = Some(worker);

        let slot = self.slot.clone();
        let tick_active = self.active.clone();
        let handle = registry.register(move || {
            if !tick_active.load(Ordering::SeqCst) {
                return;
            }
            // Reserve the hand-off before consuming, so a busy worker
            // leaves the frame in the slot instead of losing it.
            if let Ok(permit) = tx.try_reserve() {
                if let Some(image) = slot.consume() {
                    permit.send(image);
                }
            }
        });
        *self.vsync.lock().unwrap() = Some(handle);
        debug!("presentation scheduler started");
    }

    /// Stop ticking. Idempotent and safe from any thread; an in-flight
    /// delivery already on the worker completes but later ones observe
    /// the cleared active flag.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.vsync.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
        debug!("presentation scheduler stopped");
    }

    /// Whether the scheduler is currently running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for PresentationScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── FrameNotifier ────────────────────────────────────────────────

/// Coalesced frame-ready signaling for the event-driven mode.
///
/// The producer calls [`signal`](Self::signal) after pushing into the
/// slot; the consumer awaits [`ready`](Self::ready). The pending flag
/// guarantees at most one notification in flight (no duplicate
/// wake-ups), and resetting it *before* consuming guarantees no missed
/// wake-ups: a push racing with the consumer simply re-arms the flag.
#[derive(Debug, Default)]
pub struct FrameNotifier {
    pending: AtomicBool,
    notify: Notify,
}

impl FrameNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a frame ready. Returns `true` when this produced a wake-up,
    /// `false` when a notification was already pending (coalesced).
    pub fn signal(&self) -> bool {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.notify.notify_one();
            true
        } else {
            false
        }
    }

    /// Wait until a frame is ready, resetting the pending flag before
    /// returning (and therefore before the caller consumes).
    pub async fn ready(&self) {
        loop {
            if self
                .pending
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`ready`](Self::ready).
    pub fn take_pending(&self) -> bool {
        self.pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether a notification is currently pending.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the coalesced consumer loop: wait for signals, drain the slot,
/// deliver on the spawned task. Returns the task handle; abort it (or
/// clear `active`) to stop.
pub fn spawn_coalesced_consumer(
    notifier: Arc<FrameNotifier>,
    slot: Arc<FrameSlot>,
    active: Arc<AtomicBool>,
    delivery: impl Fn(SharedImage) + Send + Sync + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while active.load(Ordering::SeqCst) {
            notifier.ready().await;
            if !active.load(Ordering::SeqCst) {
                break;
            }
            if let Some(image) = slot.consume() {
                delivery(image);
            }
        }
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::frame::test_support::TestImage;

    #[tokio::test]
    async fn delivers_consumed_frames_off_tick() {
        let registry = VsyncRegistry::with_interval(Duration::from_millis(1));
        let slot = Arc::new(FrameSlot::new());
        let scheduler = PresentationScheduler::new(slot.clone());

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        scheduler.start(&registry, move |image| {
            assert_eq!(image.timestamp_us(), 77);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        slot.push(TestImage::shared(77));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // One push, one delivery — ticks with nothing pending are no-ops.
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn no_delivery_without_frames() {
        let registry = VsyncRegistry::with_interval(Duration::from_millis(1));
        let scheduler = PresentationScheduler::new(Arc::new(FrameSlot::new()));

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        scheduler.start(&registry, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        scheduler.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_vsync() {
        let registry = VsyncRegistry::with_interval(Duration::from_millis(1));
        let scheduler = PresentationScheduler::new(Arc::new(FrameSlot::new()));
        scheduler.start(&registry, |_| {});
        assert!(scheduler.is_active());
        assert_eq!(registry.consumer_count(), 1);

        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_active());
        assert_eq!(registry.consumer_count(), 0);
    }

    #[tokio::test]
    async fn notifier_coalesces_signals() {
        let notifier = FrameNotifier::new();
        assert!(notifier.signal());
        // Second signal while pending: no duplicate wake-up.
        assert!(!notifier.signal());
        assert!(notifier.is_pending());

        notifier.ready().await;
        assert!(!notifier.is_pending());

        // After the reset, the next signal produces exactly one wake-up.
        assert!(notifier.signal());
    }

    #[test]
    fn notifier_ready_pends_until_signaled() {
        let notifier = Arc::new(FrameNotifier::new());
        let waiter = notifier.clone();
        let mut fut = tokio_test::task::spawn(async move { waiter.ready().await });

        tokio_test::assert_pending!(fut.poll());
        notifier.signal();
        assert!(fut.is_woken());
        tokio_test::assert_ready!(fut.poll());
        assert!(!notifier.is_pending());
    }

    #[tokio::test]
    async fn notifier_no_missed_wakeup_across_wait() {
        let notifier = Arc::new(FrameNotifier::new());
        let waiter = notifier.clone();
        let task = tokio::spawn(async move {
            waiter.ready().await;
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        notifier.signal();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter woke up")
            .unwrap();
    }

    #[tokio::test]
    async fn coalesced_consumer_delivers_latest() {
        let notifier = Arc::new(FrameNotifier::new());
        let slot = Arc::new(FrameSlot::new());
        let active = Arc::new(AtomicBool::new(true));

        let delivered = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let task = spawn_coalesced_consumer(
            notifier.clone(),
            slot.clone(),
            active.clone(),
            move |image| {
                sink.lock().unwrap().push(image.timestamp_us());
            },
        );

        // Two pushes before the consumer runs: latest wins, one skip.
        slot.push(TestImage::shared(1));
        notifier.signal();
        slot.push(TestImage::shared(2));
        notifier.signal();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = delivered.lock().unwrap().clone();
        assert_eq!(seen, vec![2]);
        assert_eq!(slot.stats().skipped, 1);

        active.store(false, Ordering::SeqCst);
        notifier.signal();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}
