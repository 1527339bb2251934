//! Packets-per-second meter.
//!
//! Used both by admission control (§4.5) and by [`crate::pool::WorkerPool::queue_stats`]
//! telemetry. Cheap to clone — all clones share the same counters via
//! `Arc<Mutex<_>>`, the same shape the teacher uses for its shared output buffer.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Inner {
    /// Count accumulated in the window that just closed.
    old: u64,
    /// Count accumulating in the current window.
    now: u64,
    /// Start of the current window.
    window_start: Instant,
    /// Smoothed rate as of the last window roll.
    rate: f64,
}

/// Smoothed events-per-second counter with a 1-second window.
#[derive(Clone)]
pub struct PpsMeter {
    inner: Arc<Mutex<Inner>>,
}

impl PpsMeter {
    pub fn new() -> Self {
        PpsMeter {
            inner: Arc::new(Mutex::new(Inner {
                old: 0,
                now: 0,
                window_start: Instant::now(),
                rate: 0.0,
            })),
        }
    }

    /// Record one event at `at` and return the current smoothed rate.
    ///
    /// When at least one second has elapsed since the window opened, the
    /// window rolls: `old` becomes `now`, `now` resets to zero, and `rate` is
    /// recomputed from the just-closed window's count.
    pub fn record(&self, at: Instant) -> f64 {
        let mut inner = self.inner.lock().expect("PpsMeter mutex poisoned");
        inner.now += 1;
        self.roll_if_due(&mut inner, at);
        inner.rate
    }

    /// Current smoothed rate without recording an event.
    pub fn rate(&self, at: Instant) -> f64 {
        let mut inner = self.inner.lock().expect("PpsMeter mutex poisoned");
        self.roll_if_due(&mut inner, at);
        inner.rate
    }

    fn roll_if_due(&self, inner: &mut Inner, at: Instant) {
        if at.saturating_duration_since(inner.window_start) >= Duration::from_secs(1) {
            inner.old = inner.now;
            inner.rate = inner.old as f64;
            inner.now = 0;
            inner.window_start = at;
        }
    }
}

impl Default for PpsMeter {
    fn default() -> Self {
        Self::new()
    }
}
