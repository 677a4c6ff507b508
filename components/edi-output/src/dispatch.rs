//! Deadline-ordered emission of PFT fragments.
//!
//! Fragment spreading schedules every fragment against the monotonic clock
//! captured when its group was built; groups spread beyond one frame
//! duration overlap in the heap, which is what interleaves them.

use crate::udp::UdpDestination;
use bytes::Bytes;
use log::warn;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify};

struct ScheduledFragment {
    emit_at: Instant,
    payload: Bytes,
    seq: u64,
}

impl PartialEq for ScheduledFragment {
    fn eq(&self, other: &Self) -> bool {
        self.emit_at == other.emit_at && self.seq == other.seq
    }
}

impl Eq for ScheduledFragment {}

impl PartialOrd for ScheduledFragment {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledFragment {
    // reversed: BinaryHeap is a max-heap and we want the earliest deadline
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.emit_at.cmp(&self.emit_at).then(other.seq.cmp(&self.seq))
    }
}

#[derive(Clone)]
pub struct FragmentDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    queue: Mutex<BinaryHeap<ScheduledFragment>>,
    notify: Notify,
    next_seq: AtomicU64,
    dests: Vec<Arc<UdpDestination>>,
}

impl FragmentDispatcher {
    pub fn spawn(dests: Vec<Arc<UdpDestination>>, shutdown: watch::Receiver<bool>) -> Self {
        let inner = Arc::new(DispatcherInner {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            dests,
        });
        tokio::spawn(run(inner.clone(), shutdown));
        Self { inner }
    }

    pub fn schedule(&self, emit_at: Instant, payload: Bytes) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.queue.lock().push(ScheduledFragment { emit_at, payload, seq });
        self.inner.notify.notify_one();
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

async fn run(inner: Arc<DispatcherInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let next_deadline = inner.queue.lock().peek().map(|f| f.emit_at);
        match next_deadline {
            None => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = inner.notify.notified() => {}
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    // an earlier deadline may have been scheduled meanwhile
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        emit_due(&inner).await;
                    }
                }
            }
        }
    }
}

async fn emit_due(inner: &DispatcherInner) {
    loop {
        let due = {
            let mut queue = inner.queue.lock();
            match queue.peek() {
                Some(fragment) if fragment.emit_at <= Instant::now() => queue.pop(),
                _ => None,
            }
        };
        let Some(fragment) = due else { break };
        for dest in &inner.dests {
            if let Err(err) = dest.send(&fragment.payload).await {
                warn!("UDP send to {} failed: {err}", dest.dest());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UdpDestConfig;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    #[tokio::test(flavor = "multi_thread")]
    async fn emits_in_deadline_order_across_groups() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = receiver.local_addr().unwrap();
        let dest = Arc::new(
            UdpDestination::open(&UdpDestConfig {
                dest_addr: addr.ip(),
                dest_port: addr.port(),
                source_addr: None,
                source_port: None,
                ttl: None,
            })
            .expect("open"),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = FragmentDispatcher::spawn(vec![dest], shutdown_rx);

        let start = Instant::now();
        // schedule out of order; the second "group" interleaves the first
        dispatcher.schedule(start + Duration::from_millis(60), Bytes::from_static(b"a-late"));
        dispatcher.schedule(start + Duration::from_millis(20), Bytes::from_static(b"a-early"));
        dispatcher.schedule(start + Duration::from_millis(40), Bytes::from_static(b"b-mid"));

        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        for _ in 0..3 {
            let (len, _) = timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
                .await
                .expect("datagram in time")
                .expect("recv");
            received.push(buf[..len].to_vec());
        }
        assert_eq!(received, vec![b"a-early".to_vec(), b"b-mid".to_vec(), b"a-late".to_vec()]);
        assert_eq!(dispatcher.pending(), 0);
    }
}
