//! Mode decisions and periodic housekeeping.

use crate::config::Mode;
use crate::context::RelayContext;
use crate::metrics::{get, inc};
use crate::receiver::SourceState;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// One supervision pass per ten 24 ms frames.
const TICK: Duration = Duration::from_millis(240);
/// Snapshot refresh cadence, in ticks.
const SNAPSHOT_EVERY: u32 = 4;

pub struct Supervisor {
    context: Arc<RelayContext>,
    /// Pre-rendered stats JSON served by the status page.
    snapshot: Arc<Mutex<String>>,
}

impl Supervisor {
    pub fn new(context: Arc<RelayContext>) -> Self {
        Self { context, snapshot: Arc::new(Mutex::new(String::from("{}"))) }
    }

    pub fn snapshot_handle(&self) -> Arc<Mutex<String>> {
        self.snapshot.clone()
    }

    /// Activates sources for the configured mode before any data flows.
    pub fn startup_activation(&self) {
        match self.context.mode {
            Mode::Merging => {
                for source in &self.context.sources {
                    source.set_active(source.is_enabled());
                }
            }
            Mode::Switching => self.ensure_one_active(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_tagpackets = get(&self.context.counters.num_tagpackets);
        let mut ticks: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }

            match self.context.mode {
                Mode::Merging => {
                    for source in &self.context.sources {
                        let enabled = source.is_enabled();
                        if source.is_active() != enabled {
                            source.set_active(enabled);
                        }
                    }
                }
                Mode::Switching => self.switching_decision(Instant::now()),
            }

            let tagpackets = get(&self.context.counters.num_tagpackets);
            if tagpackets == last_tagpackets {
                inc(&self.context.counters.num_poll_timeouts);
            }
            last_tagpackets = tagpackets;

            ticks = ticks.wrapping_add(1);
            if ticks % SNAPSHOT_EVERY == 0 {
                *self.snapshot.lock() = crate::snapshot::stats_json(&self.context).to_string();
            }
        }
    }

    /// Keeps exactly one enabled source active, rotating away from sources
    /// that were disabled, went silent or degraded the output.
    pub fn switching_decision(&self, now: Instant) {
        let sources = &self.context.sources;
        let active_count = sources.iter().filter(|s| s.is_active()).count();
        if active_count > 1 {
            error!("switching error: more than one input active");
        }
        let Some(index) = sources.iter().position(|s| s.is_active()) else {
            self.ensure_one_active();
            return;
        };
        let current = &sources[index];

        let mut force_switch = false;
        if !current.is_enabled() {
            info!("unset {} active", current.label());
            current.active.store(false, Ordering::Relaxed);
            force_switch = true;
        }

        let silent = match current.last_activity() {
            Some(at) => now.saturating_duration_since(at) > self.context.switch_delay,
            None => true,
        };
        let output_unhappy = !self.context.queue.is_running_ok();
        if !(force_switch || silent || output_unhappy) {
            return;
        }

        let mut switched = false;
        for step in 1..sources.len() {
            let candidate = &sources[(index + step) % sources.len()];
            if candidate.is_enabled() {
                current.active.store(false, Ordering::Relaxed);
                candidate.set_active(true);
                switched = true;
                warn!(
                    "switching from {} to {} because of lack of data",
                    current.label(),
                    candidate.label()
                );
                break;
            }
        }
        if !switched {
            self.ensure_one_active();
        }
    }

    fn ensure_one_active(&self) {
        let sources = &self.context.sources;
        if sources.iter().any(|s| s.is_active()) {
            return;
        }
        if let Some(source) = sources.iter().find(|s| s.is_enabled()) {
            info!("activating first input {}", source.label());
            source.set_active(true);
        }
    }
}

/// Warns when a startup configuration has nothing to receive from.
pub fn warn_if_nothing_enabled(sources: &[Arc<SourceState>]) {
    if !sources.iter().any(|s| s.is_enabled()) {
        warn!("starting up with zero enabled sources, is the input list complete?");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::gate::OutputGate;
    use crate::merge::MergeQueue;
    use crate::metrics::OutputCounters;
    use crate::settings::RelaySettings;
    use edi_wire::{FrameTimestamp, SeqInfo};

    fn context(mode: Mode, sources: Vec<Arc<SourceState>>) -> Arc<RelayContext> {
        let settings = Arc::new(RelaySettings::new(None, true, 0));
        let gate = Arc::new(OutputGate::new());
        let counters = Arc::new(OutputCounters::new());
        let queue = Arc::new(MergeQueue::new(settings.clone(), gate.clone(), counters.clone()));
        Arc::new(RelayContext {
            sources,
            settings,
            counters,
            gate,
            queue,
            mode,
            switch_delay: Duration::from_millis(2000),
            startup: Instant::now(),
            tcp_outputs: vec![],
        })
    }

    fn feed(source: &Arc<SourceState>, queue: &MergeQueue, seconds: u32, dlfc: u16) {
        queue.push(crate::merge::TagPacket {
            source_labels: source.hostname.clone(),
            source: source.clone(),
            seq: SeqInfo::default(),
            dlfc,
            afpacket: vec![],
            timestamp: FrameTimestamp { seconds, utco: 0, tsta: 0 },
            received_at: Instant::now(),
        });
    }

    #[test]
    fn switches_after_silence() {
        let a = SourceState::new("a", 1, true);
        let b = SourceState::new("b", 2, true);
        let ctx = context(Mode::Switching, vec![a.clone(), b.clone()]);
        let supervisor = Supervisor::new(ctx.clone());
        supervisor.startup_activation();
        assert!(a.is_active());
        assert!(!b.is_active());

        // fresh activity keeps A active
        a.set_active(true);
        supervisor.switching_decision(Instant::now());
        assert!(a.is_active());

        // silence beyond switch_delay rotates to B, exactly one transition
        let later = Instant::now() + Duration::from_millis(2500);
        supervisor.switching_decision(later);
        assert!(!a.is_active());
        assert!(b.is_active());
        let connects_before = b.num_connects.load(Ordering::Relaxed);
        supervisor.switching_decision(later);
        assert!(b.is_active());
        assert_eq!(b.num_connects.load(Ordering::Relaxed), connects_before);
    }

    #[test]
    fn disabling_active_source_forces_switch() {
        let a = SourceState::new("a", 1, true);
        let b = SourceState::new("b", 2, true);
        let ctx = context(Mode::Switching, vec![a.clone(), b.clone()]);
        let supervisor = Supervisor::new(ctx);
        supervisor.startup_activation();

        a.enabled.store(false, Ordering::Relaxed);
        supervisor.switching_decision(Instant::now());
        assert!(!a.is_active());
        assert!(b.is_active());
    }

    #[test]
    fn unhealthy_output_forces_switch() {
        let a = SourceState::new("a", 1, true);
        let b = SourceState::new("b", 2, true);
        let ctx = context(Mode::Switching, vec![a.clone(), b.clone()]);
        let supervisor = Supervisor::new(ctx.clone());
        supervisor.startup_activation();

        for _ in 0..12 {
            ctx.queue.mark_late();
        }
        supervisor.switching_decision(Instant::now());
        assert!(b.is_active());
    }

    #[test]
    fn no_enabled_fallback_leaves_nothing_active() {
        let a = SourceState::new("a", 1, true);
        let b = SourceState::new("b", 2, false);
        let ctx = context(Mode::Switching, vec![a.clone(), b.clone()]);
        let supervisor = Supervisor::new(ctx);
        supervisor.startup_activation();

        a.enabled.store(false, Ordering::Relaxed);
        supervisor.switching_decision(Instant::now());
        assert!(!a.is_active());
        assert!(!b.is_active());

        // re-enabling the fallback brings one source back
        b.enabled.store(true, Ordering::Relaxed);
        supervisor.switching_decision(Instant::now());
        assert!(b.is_active());
    }

    #[test]
    fn merge_data_still_flows_during_switch() {
        let a = SourceState::new("a", 1, true);
        let b = SourceState::new("b", 2, true);
        let ctx = context(Mode::Switching, vec![a.clone(), b.clone()]);
        let supervisor = Supervisor::new(ctx.clone());
        supervisor.startup_activation();

        feed(&b, &ctx.queue, 100, 1);
        let later = Instant::now() + Duration::from_secs(3);
        supervisor.switching_decision(later);
        assert!(b.is_active());
        assert_eq!(ctx.queue.len(), 1);
    }
}
