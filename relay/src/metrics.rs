use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between the merge queue, the paced sender and the
/// supervisor. All increment-only, reset through the control socket.
#[derive(Debug, Default)]
pub struct OutputCounters {
    pub num_frames: AtomicU64,
    pub num_dropped: AtomicU64,
    pub num_queue_overruns: AtomicU64,
    pub num_dlfc_discontinuities: AtomicU64,
    /// Frames assembled by any receiver, fed to the merge queue.
    pub num_tagpackets: AtomicU64,
    /// Supervisor ticks during which no receiver produced data.
    pub num_poll_timeouts: AtomicU64,
}

impl OutputCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.num_frames.store(0, Ordering::Relaxed);
        self.num_dropped.store(0, Ordering::Relaxed);
        self.num_queue_overruns.store(0, Ordering::Relaxed);
        self.num_dlfc_discontinuities.store(0, Ordering::Relaxed);
        self.num_tagpackets.store(0, Ordering::Relaxed);
        self.num_poll_timeouts.store(0, Ordering::Relaxed);
    }
}

pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
