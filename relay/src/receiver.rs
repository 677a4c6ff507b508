//! Per-source TCP ingest: connect, keepalive, decode, reconnect.

use crate::eti::EtiMux;
use crate::merge::{MergeQueue, TagPacket};
use crate::metrics::{inc, OutputCounters};
use log::{debug, info, warn};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Delay between reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(480);
/// Idle-poll period while a source is inactive or waiting for data.
const TICK: Duration = Duration::from_millis(240);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_BUF_LEN: usize = 2048;

// TCP keepalive: detect half-open connections within roughly 20 seconds.
const KEEPALIVE_TIME: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);
const KEEPALIVE_RETRIES: u32 = 3;

/// Margin measurements retained for the statistics ring.
const MAX_MARGIN_SAMPLES: usize = 2500;

#[derive(Debug, Clone)]
pub struct ConnectionErrorInfo {
    pub message: String,
    pub at: SystemTime,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarginStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stdev: f64,
    pub num_measurements: usize,
}

#[derive(Debug, Default)]
struct SourceInner {
    last_rx_mono: Option<Instant>,
    last_rx_wall: Option<SystemTime>,
    reconnected_at: Option<Instant>,
    activated_at: Option<Instant>,
    margins_ms: VecDeque<i64>,
    last_error: Option<ConnectionErrorInfo>,
}

/// Shared state of one upstream source, read by the supervisor, the control
/// socket and the stats snapshot.
#[derive(Debug)]
pub struct SourceState {
    pub hostname: String,
    pub port: u16,
    /// User-controlled through the CLI and the control socket.
    pub enabled: AtomicBool,
    /// In merging mode mirrors `enabled`; in switching mode exactly one
    /// enabled source is active.
    pub active: AtomicBool,
    pub connected: AtomicBool,
    pub num_connects: AtomicU64,
    /// Late frames attributed to this source by the transmitter side.
    pub num_late: AtomicU64,
    inner: Mutex<SourceInner>,
}

impl SourceState {
    pub fn new(hostname: impl Into<String>, port: u16, enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            hostname: hostname.into(),
            port,
            enabled: AtomicBool::new(enabled),
            active: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            num_connects: AtomicU64::new(0),
            num_late: AtomicU64::new(0),
            inner: Mutex::new(SourceInner::default()),
        })
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
        if active {
            self.inner.lock().activated_at = Some(Instant::now());
        }
    }

    /// Stamps a successful receive; returns true when this is the
    /// disconnected-to-connected transition.
    fn record_rx(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_rx_mono = Some(now);
        inner.last_rx_wall = Some(SystemTime::now());
        let reconnected = !self.connected.swap(true, Ordering::Relaxed);
        if reconnected {
            self.num_connects.fetch_add(1, Ordering::Relaxed);
            inner.reconnected_at = Some(now);
        }
        reconnected
    }

    fn record_disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn record_margin(&self, margin_ms: i64) {
        let mut inner = self.inner.lock();
        if inner.margins_ms.len() >= MAX_MARGIN_SAMPLES {
            inner.margins_ms.pop_front();
        }
        inner.margins_ms.push_back(margin_ms);
    }

    pub fn margin_stats(&self) -> MarginStats {
        let inner = self.inner.lock();
        let n = inner.margins_ms.len();
        if n == 0 {
            return MarginStats::default();
        }
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0;
        for &m in &inner.margins_ms {
            let v = m as f64;
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let mean = sum / n as f64;
        let sq_sum: f64 = inner.margins_ms.iter().map(|&m| (m as f64 - mean).powi(2)).sum();
        MarginStats { min, max, mean, stdev: (sq_sum / n as f64).sqrt(), num_measurements: n }
    }

    /// Instant of the most recent data, falling back to the moment the
    /// source was last activated. Used by the switching decision.
    pub fn last_activity(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        inner.last_rx_mono.or(inner.activated_at)
    }

    pub fn last_rx_wall(&self) -> Option<SystemTime> {
        self.inner.lock().last_rx_wall
    }

    pub fn connection_uptime_ms(&self) -> u64 {
        let inner = self.inner.lock();
        match inner.reconnected_at {
            Some(at) if self.connected.load(Ordering::Relaxed) => at.elapsed().as_millis() as u64,
            _ => 0,
        }
    }

    pub fn set_connect_error(&self, message: impl Into<String>) {
        self.inner.lock().last_error =
            Some(ConnectionErrorInfo { message: message.into(), at: SystemTime::now() });
    }

    pub fn last_connect_error(&self) -> Option<ConnectionErrorInfo> {
        self.inner.lock().last_error.clone()
    }

    pub fn reset_counters(&self) {
        self.num_connects.store(0, Ordering::Relaxed);
        self.num_late.store(0, Ordering::Relaxed);
    }
}

/// Owns the socket and decoder of one source and feeds assembled frames to
/// the merge queue (and optionally the ETI sideband).
pub struct Receiver {
    source: Arc<SourceState>,
    queue: Arc<MergeQueue>,
    counters: Arc<OutputCounters>,
    eti: Option<Arc<Mutex<EtiMux>>>,
}

impl Receiver {
    pub fn spawn(
        source: Arc<SourceState>,
        queue: Arc<MergeQueue>,
        counters: Arc<OutputCounters>,
        eti: Option<Arc<Mutex<EtiMux>>>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        if source.is_active() {
            info!("connecting to TCP {}", source.label());
        }
        let receiver = Receiver { source, queue, counters, eti };
        tokio::spawn(receiver.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if !self.source.is_active() {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(TICK) => continue,
                }
            }

            match self.connect().await {
                Ok(stream) => {
                    self.pump(stream, &mut shutdown).await;
                    self.source.record_disconnect();
                }
                Err(err) => {
                    debug!("connecting to {} failed: {err}", self.source.label());
                    self.source.set_connect_error(err.to_string());
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        let stream = timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.source.hostname.as_str(), self.source.port)),
        )
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;

        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_INTERVAL)
            .with_retries(KEEPALIVE_RETRIES);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        Ok(stream)
    }

    /// Reads the stream until EOF, error, deactivation or shutdown. The
    /// decoder lives and dies with the connection.
    async fn pump(&self, mut stream: TcpStream, shutdown: &mut watch::Receiver<bool>) {
        let mut decoder = edi_wire::EdiDecoder::new();
        let mut buf = [0u8; READ_BUF_LEN];
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {
                    if !self.source.is_active() {
                        info!("disconnecting from TCP {}", self.source.label());
                        return;
                    }
                }
                read = stream.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("remote {} closed connection", self.source.label());
                        return;
                    }
                    Ok(n) => {
                        if self.source.record_rx() {
                            debug!("connection to {} established", self.source.label());
                        }
                        for frame in decoder.push_bytes(&buf[..n]) {
                            self.assemble(frame);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        if err.kind() == std::io::ErrorKind::ConnectionRefused {
                            debug!("receive from {}: connection refused", self.source.label());
                        } else {
                            warn!("TCP receive from {} failed: {err}", self.source.label());
                        }
                        self.source.set_connect_error(err.to_string());
                        return;
                    }
                }
            }
        }
    }

    /// Turns one decoded AF packet into a queue element.
    fn assemble(&self, frame: edi_wire::DecodedFrame) {
        inc(&self.counters.num_tagpackets);
        let timestamp = frame.deti.timestamp_or_invalid();
        if timestamp.valid() {
            let margin_ms = match timestamp.to_wallclock().duration_since(SystemTime::now()) {
                Ok(ahead) => ahead.as_millis() as i64,
                Err(behind) => -(behind.duration().as_millis() as i64),
            };
            self.source.record_margin(margin_ms);
        }

        if let Some(eti) = &self.eti {
            match crate::eti::reconstruct_frame(&frame) {
                Ok(raw) => {
                    if let Err(err) = eti.lock().push_frame(raw, frame.deti.fc.fp) {
                        warn!("ETI sideband: {err}");
                    }
                }
                Err(err) => debug!("skipping ETI reconstruction for {}: {err}", self.source.label()),
            }
        }

        let tagpacket = TagPacket {
            source_labels: self.source.hostname.clone(),
            source: self.source.clone(),
            seq: frame.seq,
            dlfc: frame.deti.fc.dlfc,
            afpacket: frame.afpacket,
            timestamp,
            received_at: Instant::now(),
        };
        self.queue.push(tagpacket);
    }
}
