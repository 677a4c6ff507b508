//! Time-ordered merge and deduplication queue between the receivers and the
//! paced transmitter.

use crate::gate::OutputGate;
use crate::metrics::{inc, OutputCounters};
use crate::receiver::SourceState;
use crate::settings::RelaySettings;
use edi_wire::{FrameTimestamp, SeqInfo};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Notify;

/// Upper bound on queued frames; the oldest frame gives way beyond it.
pub const MAX_PENDING_TAGPACKETS: usize = 1000;

const LATE_SCORE_MAX: u32 = 200;
const LATE_SCORE_INCREMENT: u32 = 10;
/// The output counts as healthy while the late score stays below this.
const LATE_SCORE_UNHEALTHY: u32 = 100;

/// One frame waiting for release.
#[derive(Debug, Clone)]
pub struct TagPacket {
    /// Hostnames that delivered this frame, `;`-separated when redundant
    /// sources collapsed onto one entry.
    pub source_labels: String,
    pub source: Arc<SourceState>,
    pub seq: SeqInfo,
    pub dlfc: u16,
    /// Complete AF packet bytes as received.
    pub afpacket: Vec<u8>,
    pub timestamp: FrameTimestamp,
    pub received_at: Instant,
}

#[derive(Debug, Default)]
struct QueueInner {
    pending: VecDeque<TagPacket>,
    most_recent_emitted: FrameTimestamp,
    late_score: u32,
}

/// Pending frames ordered by strictly increasing timestamp. One mutex
/// protects the list, the last emitted timestamp and the late score; the
/// notifier wakes the transmitter.
pub struct MergeQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    settings: Arc<RelaySettings>,
    gate: Arc<OutputGate>,
    counters: Arc<OutputCounters>,
}

impl MergeQueue {
    pub fn new(settings: Arc<RelaySettings>, gate: Arc<OutputGate>, counters: Arc<OutputCounters>) -> Self {
        Self { inner: Mutex::new(QueueInner::default()), notify: Notify::new(), settings, gate, counters }
    }

    /// Inserts one frame, preserving timestamp order and collapsing
    /// duplicates from redundant sources.
    pub fn push(&self, tagpacket: TagPacket) {
        let mut inner = self.inner.lock();

        if let Some(delay_ms) = self.settings.delay_ms() {
            let release = add_millis(tagpacket.timestamp.to_wallclock(), delay_ms);
            if release < SystemTime::now() {
                inner.late_score = (inner.late_score + LATE_SCORE_INCREMENT).min(LATE_SCORE_MAX);
                tagpacket.source.num_late.fetch_add(1, Ordering::Relaxed);
                inc(&self.counters.num_dropped);
                trace!("dropping late frame dlfc={} from {}", tagpacket.dlfc, tagpacket.source_labels);
                return;
            }
        }

        if inner.most_recent_emitted.valid() && inner.most_recent_emitted >= tagpacket.timestamp {
            trace!(
                "dropping duplicate-and-late frame dlfc={} from {}",
                tagpacket.dlfc,
                tagpacket.source_labels
            );
            return;
        }

        if self.gate.is_inhibited(Instant::now()) {
            inc(&self.counters.num_dropped);
            return;
        }

        let index = inner.pending.partition_point(|entry| entry.timestamp <= tagpacket.timestamp);
        if index > 0 {
            let previous = &mut inner.pending[index - 1];
            if previous.timestamp == tagpacket.timestamp {
                if previous.dlfc != tagpacket.dlfc {
                    warn!(
                        "sources disagree on DLFC for the same timestamp: {} says {}, {} says {}",
                        previous.source_labels, previous.dlfc, tagpacket.source_labels, tagpacket.dlfc
                    );
                } else {
                    debug!(
                        "collapsing duplicate frame dlfc={} from {}",
                        tagpacket.dlfc, tagpacket.source_labels
                    );
                }
                if !previous.source_labels.split(';').any(|label| label == tagpacket.source_labels) {
                    previous.source_labels.push(';');
                    previous.source_labels.push_str(&tagpacket.source_labels);
                }
                return;
            }
        }

        inner.pending.insert(index, tagpacket);
        if inner.pending.len() > MAX_PENDING_TAGPACKETS {
            inner.pending.pop_front();
            inc(&self.counters.num_queue_overruns);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Waits for the next frame and records its timestamp as emitted.
    pub async fn pop(&self) -> TagPacket {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(tagpacket) = inner.pending.pop_front() {
                    inner.most_recent_emitted = tagpacket.timestamp;
                    return tagpacket;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Drops all pending frames, e.g. when an inhibit window opens.
    pub fn clear(&self) {
        self.inner.lock().pending.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_late(&self) {
        let mut inner = self.inner.lock();
        inner.late_score = (inner.late_score + LATE_SCORE_INCREMENT).min(LATE_SCORE_MAX);
    }

    pub fn mark_on_time(&self) {
        let mut inner = self.inner.lock();
        inner.late_score = inner.late_score.saturating_sub(1);
    }

    pub fn reset_late_score(&self) {
        self.inner.lock().late_score = 0;
    }

    pub fn late_score(&self) -> u32 {
        self.inner.lock().late_score
    }

    pub fn is_running_ok(&self) -> bool {
        self.late_score() < LATE_SCORE_UNHEALTHY
    }
}

pub fn add_millis(time: SystemTime, ms: i64) -> SystemTime {
    if ms >= 0 {
        time + Duration::from_millis(ms as u64)
    } else {
        time - Duration::from_millis(ms.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn fixture() -> (Arc<RelaySettings>, Arc<OutputGate>, Arc<OutputCounters>, MergeQueue) {
        let settings = Arc::new(RelaySettings::new(None, true, 0));
        let gate = Arc::new(OutputGate::new());
        let counters = Arc::new(OutputCounters::new());
        let queue = MergeQueue::new(settings.clone(), gate.clone(), counters.clone());
        (settings, gate, counters, queue)
    }

    fn packet(seconds: u32, tsta: u32, dlfc: u16, host: &str) -> TagPacket {
        let source = SourceState::new(host, 9000, true);
        TagPacket {
            source_labels: host.to_string(),
            source,
            seq: SeqInfo::default(),
            dlfc,
            afpacket: vec![],
            timestamp: FrameTimestamp { seconds, utco: 0, tsta },
            received_at: Instant::now(),
        }
    }

    /// A timestamp far enough in the future that a pacing delay keeps it
    /// releasable during the test.
    fn future_seconds() -> u32 {
        let unix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        (unix - 946_684_800 + 3600) as u32
    }

    #[tokio::test]
    async fn orders_by_timestamp() {
        let (_, _, _, queue) = fixture();
        queue.push(packet(10, 500, 2, "a"));
        queue.push(packet(10, 100, 1, "a"));
        queue.push(packet(11, 0, 3, "a"));
        assert_eq!(queue.pop().await.dlfc, 1);
        assert_eq!(queue.pop().await.dlfc, 2);
        assert_eq!(queue.pop().await.dlfc, 3);
    }

    #[tokio::test]
    async fn duplicate_push_is_idempotent_and_merges_labels() {
        let (_, _, _, queue) = fixture();
        queue.push(packet(10, 100, 7, "alpha"));
        queue.push(packet(10, 100, 7, "beta"));
        queue.push(packet(10, 100, 7, "alpha"));
        assert_eq!(queue.len(), 1);
        let popped = queue.pop().await;
        assert_eq!(popped.source_labels, "alpha;beta");
    }

    #[tokio::test]
    async fn dlfc_disagreement_keeps_first_entry() {
        let (_, _, _, queue) = fixture();
        queue.push(packet(10, 100, 7, "alpha"));
        queue.push(packet(10, 100, 8, "beta"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().await.dlfc, 7);
    }

    #[tokio::test]
    async fn frames_at_or_before_emitted_timestamp_are_dropped() {
        let (_, _, _, queue) = fixture();
        queue.push(packet(10, 100, 1, "a"));
        queue.pop().await;
        queue.push(packet(10, 100, 1, "a"));
        queue.push(packet(9, 0, 0, "a"));
        assert!(queue.is_empty());
        queue.push(packet(10, 101, 2, "a"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn overflow_drops_oldest() {
        let (_, _, counters, queue) = fixture();
        for i in 0..(MAX_PENDING_TAGPACKETS as u32 + 5) {
            queue.push(packet(100 + i, 0, (i % 5000) as u16, "a"));
        }
        assert_eq!(queue.len(), MAX_PENDING_TAGPACKETS);
        assert_eq!(counters.num_queue_overruns.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn late_frames_dropped_when_delay_set() {
        let (settings, _, counters, queue) = fixture();
        settings.set_delay_ms(Some(500));
        // seconds=1 is ancient history compared to the current wall clock
        let late = packet(1, 0, 1, "a");
        let source = late.source.clone();
        queue.push(late);
        assert!(queue.is_empty());
        assert_eq!(counters.num_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(queue.late_score(), 10);
        assert_eq!(source.num_late.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn on_time_frames_enqueue_when_delay_set() {
        let (settings, _, _, queue) = fixture();
        settings.set_delay_ms(Some(500));
        queue.push(packet(future_seconds(), 0, 1, "a"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn inhibit_window_drops_pushes() {
        let (_, gate, counters, queue) = fixture();
        gate.inhibit_for(Duration::from_secs(5));
        queue.push(packet(10, 0, 1, "a"));
        assert!(queue.is_empty());
        assert_eq!(counters.num_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn late_score_law() {
        let (_, _, _, queue) = fixture();
        for _ in 0..25 {
            queue.mark_late();
        }
        assert_eq!(queue.late_score(), LATE_SCORE_MAX);
        assert!(!queue.is_running_ok());
        for _ in 0..150 {
            queue.mark_on_time();
        }
        assert_eq!(queue.late_score(), 50);
        assert!(queue.is_running_ok());
        for _ in 0..100 {
            queue.mark_on_time();
        }
        assert_eq!(queue.late_score(), 0);
    }
}
