use crate::config::Mode;
use crate::gate::OutputGate;
use crate::merge::MergeQueue;
use crate::metrics::OutputCounters;
use crate::receiver::SourceState;
use crate::settings::RelaySettings;
use edi_output::TcpServer;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything the supervisor, the control socket and the status page share.
pub struct RelayContext {
    pub sources: Vec<Arc<SourceState>>,
    pub settings: Arc<RelaySettings>,
    pub counters: Arc<OutputCounters>,
    pub gate: Arc<OutputGate>,
    pub queue: Arc<MergeQueue>,
    pub mode: Mode,
    pub switch_delay: Duration,
    pub startup: Instant,
    /// Handles onto the EDI TCP output servers, for connection stats.
    pub tcp_outputs: Vec<TcpServer>,
}

impl RelayContext {
    pub fn find_source(&self, label: &str) -> Option<&Arc<SourceState>> {
        self.sources.iter().find(|source| source.label() == label)
    }
}
