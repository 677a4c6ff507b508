//! Assembles outgoing AF/PFT frames and fans them out to every destination.

use crate::dispatch::FragmentDispatcher;
use crate::fragment::fragment_af;
use crate::tcp::{TcpServer, TcpServerStats};
use crate::udp::UdpDestination;
use crate::{DestinationConfig, OutputError, SenderConfig};
use bytes::Bytes;
use edi_wire::af;
use edi_wire::tag::pad_to_alignment;
use log::info;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Nominal duration of one frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(24);

/// One logical AF packet per [`Sender::write`] call, delivered to every
/// configured destination. The AF and PFT sequence counters increment per
/// packet and can both be overridden for the next packet so redundant
/// instances stay aligned.
pub struct Sender {
    config: SenderConfig,
    udp: Vec<Arc<UdpDestination>>,
    tcp: Vec<TcpServer>,
    dispatcher: FragmentDispatcher,
    af_seq: u16,
    pseq: u16,
    override_af: Option<u16>,
    override_pft: Option<u16>,
}

impl Sender {
    pub async fn open(config: SenderConfig, shutdown: watch::Receiver<bool>) -> Result<Sender, OutputError> {
        let mut udp = Vec::new();
        let mut tcp = Vec::new();
        for destination in &config.destinations {
            match destination {
                DestinationConfig::Udp(cfg) => {
                    let dest = UdpDestination::open(cfg)?;
                    info!("EDI UDP output to {}", dest.dest());
                    udp.push(Arc::new(dest));
                }
                DestinationConfig::Tcp(cfg) => {
                    tcp.push(TcpServer::bind(cfg, shutdown.clone()).await?);
                }
            }
        }
        let dispatcher = FragmentDispatcher::spawn(udp.clone(), shutdown);
        Ok(Sender { config, udp, tcp, dispatcher, af_seq: 0, pseq: 0, override_af: None, override_pft: None })
    }

    /// Sets the AF sequence number of the next packet; counting continues
    /// from there.
    pub fn override_af_sequence(&mut self, seq: u16) {
        self.override_af = Some(seq);
    }

    /// Sets the PFT sequence number of the next packet's fragments.
    pub fn override_pft_sequence(&mut self, pseq: u16) {
        self.override_pft = Some(pseq);
    }

    /// Wraps one TAG packet into an AF packet (and PFT fragments when
    /// enabled) and hands it to every destination.
    pub async fn write(&mut self, tagpacket: &[u8]) -> Result<(), OutputError> {
        let mut payload = tagpacket.to_vec();
        pad_to_alignment(&mut payload, self.config.tagpacket_alignment);

        let seq = self.override_af.take().unwrap_or(self.af_seq);
        self.af_seq = seq.wrapping_add(1);
        let afpacket = af::build(&payload, seq);

        if !self.config.pft.enable_pft {
            let frame = Bytes::from(afpacket);
            for dest in &self.udp {
                dest.send(&frame).await?;
            }
            for server in &self.tcp {
                server.broadcast(frame.clone());
            }
            return Ok(());
        }

        let pseq = self.override_pft.take().unwrap_or(self.pseq);
        self.pseq = pseq.wrapping_add(1);
        let fragments = fragment_af(&afpacket, pseq, &self.config.pft)?;

        if !self.tcp.is_empty() {
            let stream: Vec<u8> = fragments.concat();
            let stream = Bytes::from(stream);
            for server in &self.tcp {
                server.broadcast(stream.clone());
            }
        }

        if self.udp.is_empty() {
            return Ok(());
        }

        let spreading = self.config.pft.fragment_spreading_factor;
        if spreading <= 0.0 || fragments.len() == 1 {
            for fragment in &fragments {
                for dest in &self.udp {
                    dest.send(fragment).await?;
                }
            }
        } else {
            // the group finishes at start + spreading * 24 ms; deadlines are
            // fixed now, so groups spread beyond one frame interleave with
            // their successors
            let start = Instant::now();
            let spread = FRAME_DURATION.mul_f64(spreading);
            let fcount = fragments.len() as u32;
            for (i, fragment) in fragments.into_iter().enumerate() {
                let emit_at = start + spread.mul_f64((i as f64 + 1.0) / fcount as f64);
                self.dispatcher.schedule(emit_at, Bytes::from(fragment));
            }
        }
        Ok(())
    }

    pub fn tcp_stats(&self) -> Vec<TcpServerStats> {
        self.tcp.iter().map(TcpServer::stats).collect()
    }

    /// Cloneable handles onto the TCP output servers, e.g. for stats
    /// reporting outside the transmitter task.
    pub fn tcp_servers(&self) -> Vec<TcpServer> {
        self.tcp.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PftSettings, TcpServerConfig, UdpDestConfig};
    use edi_wire::EdiDecoder;
    use edi_wire::fixtures::{build_tag_payload, sample_deti};
    use tokio::net::UdpSocket;
    use tokio::time::{timeout, Duration};

    async fn open_sender(pft: PftSettings, dest: std::net::SocketAddr) -> (watch::Sender<bool>, Sender) {
        let (guard, shutdown) = watch::channel(false);
        let config = SenderConfig {
            destinations: vec![DestinationConfig::Udp(UdpDestConfig {
                dest_addr: dest.ip(),
                dest_port: dest.port(),
                source_addr: None,
                source_port: None,
                ttl: None,
            })],
            pft,
            tagpacket_alignment: 8,
        };
        let sender = Sender::open(config, shutdown).await.expect("open sender");
        (guard, sender)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn raw_af_datagrams_decode_back() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let (_guard, mut sender) = open_sender(PftSettings::default(), receiver.local_addr().unwrap()).await;

        let tagpacket = build_tag_payload(&sample_deti(17), &[]);
        sender.override_af_sequence(555);
        sender.write(&tagpacket).await.expect("write");

        let mut buf = vec![0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(2), receiver.recv_from(&mut buf)).await.expect("datagram").unwrap();

        let mut decoder = EdiDecoder::new();
        let frames = decoder.push_packet(&buf[..len]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].deti.fc.dlfc, 17);
        assert_eq!(frames[0].seq.seq, 555);
        // alignment padding kept the payload a multiple of 8
        assert_eq!(af::tag_payload(&frames[0].afpacket).unwrap().len() % 8, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spread_pft_fragments_decode_back() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let pft = PftSettings {
            enable_pft: true,
            fec: 1,
            fragment_spreading_factor: 0.5,
            max_fragment_payload: 64,
        };
        let (_guard, mut sender) = open_sender(pft, receiver.local_addr().unwrap()).await;

        let tagpacket = build_tag_payload(&sample_deti(99), &[]);
        sender.write(&tagpacket).await.expect("write");

        let mut decoder = EdiDecoder::new();
        let mut buf = vec![0u8; 4096];
        let frame = timeout(Duration::from_secs(5), async {
            loop {
                let (len, _) = receiver.recv_from(&mut buf).await.expect("recv");
                if let Some(frame) = decoder.push_packet(&buf[..len]).pop() {
                    break frame;
                }
            }
        })
        .await
        .expect("frame reassembled in time");
        assert_eq!(frame.deti.fc.dlfc, 99);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tcp_clients_receive_af_stream() {
        let (_guard, shutdown) = watch::channel(false);
        let config = SenderConfig {
            destinations: vec![DestinationConfig::Tcp(TcpServerConfig::new(0))],
            pft: PftSettings::default(),
            tagpacket_alignment: 8,
        };
        let mut sender = Sender::open(config, shutdown).await.expect("open");
        let port = sender.tcp_stats()[0].listen_port;

        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        timeout(Duration::from_secs(2), async {
            while sender.tcp_stats()[0].num_connections == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("client registered");

        for dlfc in 0..3u16 {
            sender.write(&build_tag_payload(&sample_deti(dlfc), &[])).await.expect("write");
        }

        let mut decoder = EdiDecoder::new();
        let mut decoded = Vec::new();
        let mut buf = vec![0u8; 2048];
        timeout(Duration::from_secs(2), async {
            use tokio::io::AsyncReadExt;
            while decoded.len() < 3 {
                let n = client.read(&mut buf).await.expect("read");
                decoded.extend(decoder.push_bytes(&buf[..n]));
            }
        })
        .await
        .expect("frames arrive");
        let dlfcs: Vec<u16> = decoded.iter().map(|f| f.deti.fc.dlfc).collect();
        assert_eq!(dlfcs, vec![0, 1, 2]);
    }
}
