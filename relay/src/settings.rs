use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

pub const DEFAULT_BACKOFF_MS: u64 = 5000;

/// Runtime-adjustable transmitter settings, shared between the merge queue,
/// the paced sender and the control socket.
#[derive(Debug)]
pub struct RelaySettings {
    /// Pacing delay added to each frame timestamp. `None` disables the
    /// release-time wait and the late check entirely.
    delay_ms: Mutex<Option<i64>>,
    backoff_ms: AtomicU32,
    live_stats_port: AtomicU32,
    drop_late: AtomicBool,
    verbosity: AtomicU8,
}

impl RelaySettings {
    pub fn new(delay_ms: Option<i64>, drop_late: bool, verbosity: u8) -> Self {
        Self {
            delay_ms: Mutex::new(delay_ms),
            backoff_ms: AtomicU32::new(DEFAULT_BACKOFF_MS as u32),
            live_stats_port: AtomicU32::new(0),
            drop_late: AtomicBool::new(drop_late),
            verbosity: AtomicU8::new(verbosity),
        }
    }

    pub fn delay_ms(&self) -> Option<i64> {
        *self.delay_ms.lock()
    }

    pub fn set_delay_ms(&self, delay: Option<i64>) {
        *self.delay_ms.lock() = delay;
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms.load(Ordering::Relaxed) as u64)
    }

    pub fn set_backoff_ms(&self, ms: u32) {
        self.backoff_ms.store(ms, Ordering::Relaxed);
    }

    pub fn live_stats_port(&self) -> u16 {
        self.live_stats_port.load(Ordering::Relaxed) as u16
    }

    pub fn set_live_stats_port(&self, port: u16) {
        self.live_stats_port.store(port as u32, Ordering::Relaxed);
    }

    pub fn drop_late(&self) -> bool {
        self.drop_late.load(Ordering::Relaxed)
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity.load(Ordering::Relaxed)
    }

    pub fn set_verbosity(&self, verbosity: u8) {
        self.verbosity.store(verbosity, Ordering::Relaxed);
        log::set_max_level(level_for_verbosity(verbosity));
    }
}

pub fn level_for_verbosity(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}
