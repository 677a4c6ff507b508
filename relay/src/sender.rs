//! Paced transmitter: releases each frame at a fixed offset from its
//! timestamp, tracks output health and enforces the post-fault backoff.

use crate::gate::OutputGate;
use crate::merge::{add_millis, MergeQueue, TagPacket};
use crate::metrics::{inc, OutputCounters};
use crate::settings::RelaySettings;
use edi_wire::af;
use edi_wire::tag::deti::DLFC_MODULUS;
use log::{info, warn};
use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::watch;

/// Buffering statistics are summarised once per this many frames (≈ 6 s).
const STATS_PERIOD_FRAMES: u64 = 250;

#[derive(Debug, Clone, Copy)]
struct BufferingStat {
    buffering_ms: f64,
    late: bool,
    inhibited: bool,
}

pub struct PacedSender {
    queue: Arc<MergeQueue>,
    gate: Arc<OutputGate>,
    settings: Arc<RelaySettings>,
    counters: Arc<OutputCounters>,
    last_dlfc: Option<u16>,
    was_inhibited: bool,
    stats_window: Vec<BufferingStat>,
    live_stats: Option<UdpSocket>,
}

impl PacedSender {
    pub fn new(
        queue: Arc<MergeQueue>,
        gate: Arc<OutputGate>,
        settings: Arc<RelaySettings>,
        counters: Arc<OutputCounters>,
    ) -> Self {
        Self {
            queue,
            gate,
            settings,
            counters,
            last_dlfc: None,
            was_inhibited: false,
            stats_window: Vec::new(),
            live_stats: None,
        }
    }

    pub async fn run(mut self, mut output: edi_output::Sender, mut shutdown: watch::Receiver<bool>) {
        loop {
            let tagpacket = tokio::select! {
                _ = shutdown.changed() => break,
                tagpacket = self.queue.pop() => tagpacket,
            };
            if !self.process(&mut output, tagpacket, &mut shutdown).await {
                break;
            }
        }
    }

    /// Handles one popped frame; returns false on shutdown.
    async fn process(
        &mut self,
        output: &mut edi_output::Sender,
        tagpacket: TagPacket,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut late = false;
        if let Some(delay_ms) = self.settings.delay_ms() {
            let release = add_millis(tagpacket.timestamp.to_wallclock(), delay_ms);
            match release.duration_since(SystemTime::now()) {
                Ok(wait) => {
                    tokio::select! {
                        _ = shutdown.changed() => return false,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(_) => late = true,
            }
        }

        let inhibited = self.gate.is_inhibited(Instant::now());
        self.record_stat(&tagpacket, late, inhibited);

        if late {
            self.queue.mark_late();
            tagpacket.source.num_late.fetch_add(1, Ordering::Relaxed);
            if self.settings.drop_late() {
                inc(&self.counters.num_dropped);
                return true;
            }
        }

        if inhibited {
            inc(&self.counters.num_dropped);
            self.was_inhibited = true;
            return true;
        }
        if self.was_inhibited {
            info!("output backoff ended");
            self.was_inhibited = false;
        }

        if let Some(previous) = self.last_dlfc {
            let expected = (previous + 1) % DLFC_MODULUS;
            if tagpacket.dlfc != expected {
                warn!(
                    "DLFC discontinuity from {}: expected {expected}, got {}",
                    tagpacket.source_labels, tagpacket.dlfc
                );
                inc(&self.counters.num_dlfc_discontinuities);
                inc(&self.counters.num_dropped);
                self.inhibit();
                return true;
            }
        }

        if tagpacket.seq.seq_valid {
            output.override_af_sequence(tagpacket.seq.seq);
        }
        if tagpacket.seq.pseq_valid {
            output.override_pft_sequence(tagpacket.seq.pseq);
        } else if tagpacket.seq.seq_valid {
            // sources without PFT still get PSEQ = SEQ, so redundant relay
            // instances produce identical fragment numbering downstream
            output.override_pft_sequence(tagpacket.seq.seq);
        }

        let payload = match af::tag_payload(&tagpacket.afpacket) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("undecodable AF packet reached the transmitter: {err}");
                inc(&self.counters.num_dropped);
                return true;
            }
        };
        if let Err(err) = output.write(payload).await {
            warn!("EDI output write failed: {err}");
        }

        self.last_dlfc = Some(tagpacket.dlfc);
        inc(&self.counters.num_frames);
        if !late {
            self.queue.mark_on_time();
        }
        if tagpacket.dlfc % (STATS_PERIOD_FRAMES as u16) == 0 {
            self.log_stats(tagpacket.timestamp.tsta);
        }
        true
    }

    /// Opens the inhibit window: pending frames are worthless after a
    /// continuity fault, and the health score starts over.
    fn inhibit(&mut self) {
        self.gate.inhibit_for(self.settings.backoff());
        self.queue.clear();
        self.queue.reset_late_score();
        self.last_dlfc = None;
    }

    fn record_stat(&mut self, tagpacket: &TagPacket, late: bool, inhibited: bool) {
        let buffering_ms = tagpacket.received_at.elapsed().as_secs_f64() * 1000.0;
        self.stats_window.push(BufferingStat { buffering_ms, late, inhibited });
        self.send_live_stats(tagpacket, buffering_ms, late, inhibited);
    }

    fn log_stats(&mut self, tsta: u32) {
        if self.stats_window.is_empty() {
            return;
        }
        let n = self.stats_window.len() as f64;
        let num_late = self.stats_window.iter().filter(|s| s.late).count();
        let num_inhibited = self.stats_window.iter().filter(|s| s.inhibited).count();
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0;
        for stat in &self.stats_window {
            min = min.min(stat.buffering_ms);
            max = max.max(stat.buffering_ms);
            sum += stat.buffering_ms;
        }
        let mean = sum / n;
        let sq_sum: f64 = self.stats_window.iter().map(|s| (s.buffering_ms - mean).powi(2)).sum();
        let stdev = (sq_sum / n).sqrt();
        info!(
            "buffering time statistics [ms]: min: {min:.1} max: {max:.1} mean: {mean:.1} \
             stdev: {stdev:.1} late: {num_late} of {} ({:.3}%) inhibited: {num_inhibited} of {} \
             ({:.3}%) Frame 0 TS {}",
            self.stats_window.len(),
            num_late as f64 * 100.0 / n,
            self.stats_window.len(),
            num_inhibited as f64 * 100.0 / n,
            (tsta >> 8) as f64 / 16384.0,
        );
        self.stats_window.clear();
    }

    /// Best-effort one-line JSON per frame towards the debug UDP sink.
    fn send_live_stats(&mut self, tagpacket: &TagPacket, buffering_ms: f64, late: bool, inhibited: bool) {
        let port = self.settings.live_stats_port();
        if port == 0 {
            return;
        }
        if self.live_stats.is_none() {
            self.live_stats = UdpSocket::bind("127.0.0.1:0")
                .and_then(|socket| {
                    socket.set_nonblocking(true)?;
                    Ok(socket)
                })
                .ok();
        }
        if let Some(socket) = &self.live_stats {
            let line = serde_json::json!({
                "dlfc": tagpacket.dlfc,
                "sources": tagpacket.source_labels,
                "buffering_ms": buffering_ms,
                "late": late,
                "inhibited": inhibited,
            })
            .to_string();
            let _ = socket.send_to(line.as_bytes(), ("127.0.0.1", port));
        }
    }
}
