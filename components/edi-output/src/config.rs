use std::net::IpAddr;

/// PFT settings applied to every destination of one sender.
#[derive(Debug, Clone)]
pub struct PftSettings {
    pub enable_pft: bool,
    /// Number of lost fragments per group the output protects against
    /// (Reed-Solomon parity count), 0..=5.
    pub fec: u8,
    /// Fragment spreading factor: 0.0 emits every fragment at once, 1.0
    /// spreads a group across one 24 ms frame, larger values interleave
    /// consecutive groups.
    pub fragment_spreading_factor: f64,
    /// Upper bound on a fragment payload, chosen to keep the whole datagram
    /// under the path MTU.
    pub max_fragment_payload: usize,
}

impl Default for PftSettings {
    fn default() -> Self {
        Self { enable_pft: false, fec: 0, fragment_spreading_factor: 0.95, max_fragment_payload: 1400 }
    }
}

#[derive(Debug, Clone)]
pub struct UdpDestConfig {
    pub dest_addr: IpAddr,
    pub dest_port: u16,
    pub source_addr: Option<IpAddr>,
    pub source_port: Option<u16>,
    pub ttl: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub listen_port: u16,
    /// Frames a slow client may have queued before it is dropped.
    pub client_queue_frames: usize,
}

impl TcpServerConfig {
    pub fn new(listen_port: u16) -> Self {
        Self { listen_port, client_queue_frames: 500 }
    }
}

#[derive(Debug, Clone)]
pub enum DestinationConfig {
    Udp(UdpDestConfig),
    Tcp(TcpServerConfig),
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub destinations: Vec<DestinationConfig>,
    pub pft: PftSettings,
    /// TAG packets are padded with `*dmy` so their length is a multiple of
    /// this value.
    pub tagpacket_alignment: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self { destinations: Vec::new(), pft: PftSettings::default(), tagpacket_alignment: 8 }
    }
}

impl SenderConfig {
    pub fn num_udp(&self) -> usize {
        self.destinations.iter().filter(|d| matches!(d, DestinationConfig::Udp(_))).count()
    }

    pub fn num_tcp(&self) -> usize {
        self.destinations.iter().filter(|d| matches!(d, DestinationConfig::Tcp(_))).count()
    }
}
