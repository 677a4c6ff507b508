use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Inhibit window applied to the output after a fault. Kept on the monotonic
/// clock so wall-clock steps cannot lengthen or shorten the backoff.
#[derive(Debug)]
pub struct OutputGate {
    until: Mutex<Instant>,
}

impl Default for OutputGate {
    fn default() -> Self {
        Self { until: Mutex::new(Instant::now()) }
    }
}

impl OutputGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inhibit_for(&self, backoff: Duration) {
        *self.until.lock() = Instant::now() + backoff;
    }

    pub fn is_inhibited(&self, now: Instant) -> bool {
        now < *self.until.lock()
    }

    pub fn remaining_ms(&self) -> u64 {
        self.until.lock().saturating_duration_since(Instant::now()).as_millis() as u64
    }
}
