//! Streaming decoder for an EDI byte stream.
//!
//! Accepts interleaved PFT fragments and raw AF packets on the same stream,
//! reassembles fragment groups, validates the AF layer and walks the TAG
//! items into [`DecodedFrame`]s. Bytes that match neither sync pattern are
//! skipped one at a time until the stream realigns.

use crate::af::{self, AfError};
use crate::pft::assembler::{PftAssembler, PftAssemblerConfig, PftAssemblerStats};
use crate::pft::{PftError, PftHeader, PFT_SYNC};
use crate::tag::deti::{decode_deti, decode_est, DetiData, Subchannel};
use crate::tag::{TagError, TagName, TagWalker, TAG_DETI, TAG_DMY, TAG_PTR};
use bytes::{Buf, BytesMut};
use log::{info, warn};
use std::collections::HashSet;

/// The only protocol accepted in `*ptr`.
pub const PROTOCOL_DETI: [u8; 4] = *b"DETI";

/// Sequence numbers observed on the transport layers of one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqInfo {
    pub pseq: u16,
    pub pseq_valid: bool,
    pub seq: u16,
    pub seq_valid: bool,
}

/// One fully decoded AF packet.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub seq: SeqInfo,
    pub deti: DetiData,
    pub subchannels: Vec<Subchannel>,
    /// The complete AF packet bytes, header and CRC trailer included.
    pub afpacket: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DecoderStats {
    /// Bytes skipped while searching for a sync pattern.
    pub resync_skipped: u64,
    /// AF packets dropped for CRC or framing errors.
    pub af_errors: u64,
    /// PFT fragments dropped for header errors.
    pub pft_errors: u64,
    /// AF packets dropped for TAG layer violations.
    pub tag_errors: u64,
    /// AF packets carrying an unsupported `*ptr` protocol.
    pub unsupported_protocol: u64,
    /// AF packets without a usable `deti` item.
    pub missing_deti: u64,
    pub assembler: PftAssemblerStats,
}

pub struct EdiDecoder {
    buf: BytesMut,
    assembler: PftAssembler,
    unknown_tags: HashSet<[u8; 4]>,
    protocol_warned: bool,
    stats: DecoderStats,
}

impl Default for EdiDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EdiDecoder {
    pub fn new() -> Self {
        Self::with_config(PftAssemblerConfig::default())
    }

    pub fn with_config(config: PftAssemblerConfig) -> Self {
        Self {
            buf: BytesMut::new(),
            assembler: PftAssembler::new(config),
            unknown_tags: HashSet::new(),
            protocol_warned: false,
            stats: DecoderStats::default(),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        let mut stats = self.stats;
        stats.assembler = self.assembler.stats();
        stats
    }

    /// Feeds stream bytes and returns every frame completed by them.
    pub fn push_bytes(&mut self, data: &[u8]) -> Vec<DecodedFrame> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            match self.extract_one() {
                Extraction::NeedMore => break,
                Extraction::Nothing => continue,
                Extraction::Frame(frame) => frames.push(frame),
            }
        }
        frames
    }

    /// Decodes one complete datagram (UDP-style input): either a single PFT
    /// fragment or a single AF packet. Datagram boundaries are authoritative,
    /// so trailing partial bytes are discarded instead of buffered.
    pub fn push_packet(&mut self, datagram: &[u8]) -> Vec<DecodedFrame> {
        let frames = self.push_bytes(datagram);
        self.buf.clear();
        frames
    }

    fn extract_one(&mut self) -> Extraction {
        if self.buf.len() < 2 {
            return Extraction::NeedMore;
        }

        if self.buf[..2] == PFT_SYNC {
            return self.extract_pft();
        }
        if self.buf[..2] == af::AF_SYNC {
            return self.extract_af();
        }

        self.buf.advance(1);
        self.stats.resync_skipped += 1;
        Extraction::Nothing
    }

    fn extract_pft(&mut self) -> Extraction {
        let Some(required) = PftHeader::required_len(&self.buf) else {
            return Extraction::NeedMore;
        };
        if self.buf.len() < required {
            return Extraction::NeedMore;
        }
        let (header, header_len) = match PftHeader::parse(&self.buf) {
            Ok(parsed) => parsed,
            Err(PftError::Truncated) => return Extraction::NeedMore,
            Err(err) => {
                warn!("dropping PFT fragment: {err}");
                self.stats.pft_errors += 1;
                self.buf.advance(1);
                self.stats.resync_skipped += 1;
                return Extraction::Nothing;
            }
        };
        let payload = self.buf[header_len..header_len + header.plen as usize].to_vec();
        self.buf.advance(required);

        match self.assembler.ingest(&header, &payload) {
            Ok(Some(afpacket)) => self.decode_af_packet(afpacket, Some(header.pseq)),
            Ok(None) => Extraction::Nothing,
            Err(err) => {
                warn!("dropping PFT group pseq={}: {err}", header.pseq);
                self.stats.pft_errors += 1;
                Extraction::Nothing
            }
        }
    }

    fn extract_af(&mut self) -> Extraction {
        let header = match af::AfHeader::parse(&self.buf) {
            Ok(header) => header,
            Err(AfError::Truncated) => return Extraction::NeedMore,
            Err(err) => {
                warn!("skipping bytes at AF sync: {err}");
                self.stats.af_errors += 1;
                self.buf.advance(1);
                self.stats.resync_skipped += 1;
                return Extraction::Nothing;
            }
        };
        let total = header.total_len();
        if self.buf.len() < total {
            return Extraction::NeedMore;
        }
        let packet = self.buf[..total].to_vec();
        self.buf.advance(total);
        self.decode_af_packet(packet, None)
    }

    fn decode_af_packet(&mut self, packet: Vec<u8>, pseq: Option<u16>) -> Extraction {
        self.assembler.on_af_packet();

        let (header, payload) = match af::parse(&packet) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("dropping AF packet: {err}");
                self.stats.af_errors += 1;
                return Extraction::Nothing;
            }
        };

        match self.walk_tags(payload) {
            Ok(Some((deti, subchannels))) => {
                let seq = SeqInfo {
                    pseq: pseq.unwrap_or(0),
                    pseq_valid: pseq.is_some(),
                    seq: header.seq,
                    seq_valid: true,
                };
                Extraction::Frame(DecodedFrame { seq, deti, subchannels, afpacket: packet })
            }
            Ok(None) => Extraction::Nothing,
            Err(err) => {
                warn!("dropping AF packet: {err}");
                self.stats.tag_errors += 1;
                Extraction::Nothing
            }
        }
    }

    /// Walks the TAG items of one AF payload. `Ok(None)` means the packet
    /// was well-formed but carries nothing to forward.
    fn walk_tags(&mut self, payload: &[u8]) -> Result<Option<(DetiData, Vec<Subchannel>)>, TagError> {
        let mut protocol_ok = false;
        let mut deti: Option<DetiData> = None;
        let mut subchannels: Vec<Subchannel> = Vec::new();

        for item in TagWalker::new(payload) {
            let item = item?;
            match item.name {
                TAG_PTR => {
                    if item.value.len() != 8 {
                        return Err(TagError::PayloadTooShort(TagName(TAG_PTR), "value"));
                    }
                    let proto: [u8; 4] = item.value[..4].try_into().unwrap();
                    let major = u16::from_be_bytes(item.value[4..6].try_into().unwrap());
                    let minor = u16::from_be_bytes(item.value[6..8].try_into().unwrap());
                    if proto == PROTOCOL_DETI && major == 0 && minor == 0 {
                        protocol_ok = true;
                    } else {
                        if !self.protocol_warned {
                            info!(
                                "received frame with unsupported protocol {} v{major}.{minor}",
                                TagName(proto)
                            );
                            self.protocol_warned = true;
                        }
                        self.stats.unsupported_protocol += 1;
                        return Ok(None);
                    }
                }
                TAG_DETI => {
                    if !protocol_ok {
                        return Err(TagError::DetiBeforePtr);
                    }
                    deti = Some(decode_deti(item.value)?);
                }
                TAG_DMY => {}
                name if item.is_est() => {
                    if protocol_ok {
                        subchannels.push(decode_est(name, item.value)?);
                    }
                }
                name => {
                    if self.unknown_tags.insert(name) {
                        warn!("ignoring unknown TAG item {}", TagName(name));
                    }
                }
            }
        }

        match deti {
            Some(deti) => Ok(Some((deti, subchannels))),
            None => {
                self.stats.missing_deti += 1;
                Ok(None)
            }
        }
    }

    /// Forgets all partial reassembly and framing state, e.g. after the
    /// transport reconnected.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.assembler.reset();
    }
}

enum Extraction {
    /// The buffer holds no complete unit yet.
    NeedMore,
    /// A unit was consumed without producing a frame.
    Nothing,
    Frame(DecodedFrame),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{build_tag_payload, sample_deti};
    use crate::tag::deti::encode_deti;
    use crate::tag::write_item;

    fn sample_af(dlfc: u16, seq: u16) -> Vec<u8> {
        let sub = Subchannel { stream_index: 1, scid: 10, sad: 20, tpl: 30, mst: vec![7u8; 64] };
        af::build(&build_tag_payload(&sample_deti(dlfc), &[sub]), seq)
    }

    #[test]
    fn decodes_raw_af_stream_in_pieces() {
        let mut decoder = EdiDecoder::new();
        let packet = sample_af(100, 1);
        let (a, b) = packet.split_at(13);
        assert!(decoder.push_bytes(a).is_empty());
        let frames = decoder.push_bytes(b);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.deti.fc.dlfc, 100);
        assert_eq!(frame.seq.seq, 1);
        assert!(frame.seq.seq_valid);
        assert!(!frame.seq.pseq_valid);
        assert_eq!(frame.subchannels.len(), 1);
        assert_eq!(frame.afpacket, packet);
    }

    #[test]
    fn resyncs_after_garbage() {
        let mut decoder = EdiDecoder::new();
        let mut stream = vec![0x00, 0x41, 0x46]; // noise, then 'A' 'F' lookalike prefix
        stream.extend_from_slice(&sample_af(5, 9));
        let frames = decoder.push_bytes(&stream);
        assert_eq!(frames.len(), 1);
        assert!(decoder.stats().resync_skipped > 0);
    }

    #[test]
    fn af_crc_failure_counted() {
        let mut decoder = EdiDecoder::new();
        let mut packet = sample_af(1, 1);
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert!(decoder.push_bytes(&packet).is_empty());
        assert_eq!(decoder.stats().af_errors, 1);
    }

    #[test]
    fn unsupported_protocol_not_dispatched() {
        let mut decoder = EdiDecoder::new();
        let mut payload = Vec::new();
        let mut ptr = Vec::new();
        ptr.extend_from_slice(b"XETI");
        ptr.extend_from_slice(&[0, 0, 0, 0]);
        write_item(&mut payload, TAG_PTR, &ptr);
        write_item(&mut payload, TAG_DETI, &encode_deti(&sample_deti(1)));
        let packet = af::build(&payload, 1);
        assert!(decoder.push_bytes(&packet).is_empty());
        assert_eq!(decoder.stats().unsupported_protocol, 1);
    }

    #[test]
    fn deti_before_ptr_discards_packet() {
        let mut decoder = EdiDecoder::new();
        let mut payload = Vec::new();
        write_item(&mut payload, TAG_DETI, &encode_deti(&sample_deti(1)));
        let packet = af::build(&payload, 1);
        assert!(decoder.push_bytes(&packet).is_empty());
        assert_eq!(decoder.stats().tag_errors, 1);
    }

    #[test]
    fn unknown_tags_skipped_and_warned_once() {
        let mut decoder = EdiDecoder::new();
        for seq in 0..2u16 {
            let mut payload = Vec::new();
            let mut ptr = Vec::new();
            ptr.extend_from_slice(&PROTOCOL_DETI);
            ptr.extend_from_slice(&[0, 0, 0, 0]);
            write_item(&mut payload, TAG_PTR, &ptr);
            write_item(&mut payload, *b"odd!", &[1, 2, 3]);
            write_item(&mut payload, TAG_DETI, &encode_deti(&sample_deti(seq)));
            let frames = decoder.push_bytes(&af::build(&payload, seq));
            assert_eq!(frames.len(), 1);
        }
        assert_eq!(decoder.unknown_tags.len(), 1);
    }

    #[test]
    fn pft_fragments_reassemble() {
        let mut decoder = EdiDecoder::new();
        let packet = sample_af(77, 3);
        let mid = packet.len() / 2;

        let mut stream = Vec::new();
        for (findex, chunk) in [&packet[..mid], &packet[mid..]].iter().enumerate() {
            let header = PftHeader {
                pseq: 900,
                findex: findex as u32,
                fcount: 2,
                plen: chunk.len() as u16,
                fec: None,
                addr: None,
            };
            header.write(&mut stream);
            stream.extend_from_slice(chunk);
        }

        let frames = decoder.push_bytes(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].deti.fc.dlfc, 77);
        assert_eq!(frames[0].seq.pseq, 900);
        assert!(frames[0].seq.pseq_valid);
        assert_eq!(frames[0].afpacket, packet);
    }
}
