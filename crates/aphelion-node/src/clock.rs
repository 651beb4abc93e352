//! AOS tick counter.
//!
//! Session timers run on a monotonic counter that only advances while
//! the link is acquired, so a long signal outage does not expire
//! retransmit deadlines. A background thread bumps the counter once
//! per interval and posts the new value on a channel; the runtime
//! worker services its timer wheels from that channel, never from the
//! clock thread itself.

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Ticking counter driving both engines' timer wheels.
pub struct AosClock {
    ticks: Arc<AtomicU64>,
    counting: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl AosClock {
    /// Starts the 1 Hz production clock. Each tick is published on
    /// `tick_tx`; a full channel drops the notification, the counter
    /// still advances.
    pub fn start(tick_tx: Sender<u64>) -> Self {
        Self::start_with_interval(Duration::from_secs(1), tick_tx)
    }

    pub fn start_with_interval(interval: Duration, tick_tx: Sender<u64>) -> Self {
        let ticks = Arc::new(AtomicU64::new(0));
        let counting = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(AtomicBool::new(false));

        let ticks_clone = ticks.clone();
        let counting_clone = counting.clone();
        let shutdown_clone = shutdown.clone();
        let handle = thread::Builder::new()
            .name("aphelion-aos".into())
            .spawn(move || {
                while !shutdown_clone.load(Ordering::Relaxed) {
                    thread::sleep(interval);
                    if shutdown_clone.load(Ordering::Relaxed) {
                        break;
                    }
                    if counting_clone.load(Ordering::Relaxed) {
                        let now = ticks_clone.fetch_add(1, Ordering::Relaxed) + 1;
                        let _ = tick_tx.try_send(now);
                    }
                }
            })
            .expect("failed to spawn AOS clock thread");

        Self { ticks, counting, shutdown, handle: Some(handle) }
    }

    /// Current tick value.
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Whether the counter is currently advancing.
    pub fn is_counting(&self) -> bool {
        self.counting.load(Ordering::Relaxed)
    }

    /// Pauses or resumes the counter as link acquisition comes and
    /// goes. Idempotent.
    pub fn set_counting(&self, counting: bool) {
        self.counting.store(counting, Ordering::Relaxed);
    }

    /// Stops the clock thread. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AosClock {
    fn drop(&mut self) {
        self.stop();
    }
}
