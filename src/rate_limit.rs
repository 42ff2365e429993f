// pardl - rate_limit.rs

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

/// Aggregate write-rate governor. Producers account their bytes against a
/// window with [`process`](RateLimit::process) and park once the window is
/// full; the progress ticker calls [`reset`](RateLimit::reset) once per
/// second to open the next window and release them.
pub struct RateLimit {
    max: u64,
    written: AtomicU64,
    latch: Notify,
}

impl RateLimit {
    pub fn new(max: u64) -> Self {
        RateLimit {
            max,
            written: AtomicU64::new(0),
            latch: Notify::new(),
        }
    }

    /// Counts `n` bytes against the current window, parking until a reset
    /// whenever the window is exceeded. Bytes stay counted across the park,
    /// so a release re-checks against the fresh window with the same `n`.
    pub async fn process(&self, n: u64) {
        loop {
            // Register with the latch before checking the window, so a reset
            // landing between the check and the park still releases us.
            let released = self.latch.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let written = self.written.fetch_add(n, Ordering::Relaxed) + n;
            if written <= self.max {
                return;
            }
            released.await;
        }
    }

    /// Opens a new window and wakes every parked producer.
    pub fn reset(&self) {
        self.written.store(0, Ordering::Relaxed);
        self.latch.notify_waiters();
    }
}
