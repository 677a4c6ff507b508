//! Deterministic frame builders used by tests and tooling.

use crate::af;
use crate::tag::deti::{encode_deti, encode_est, DetiData, FrameCharacterisation, Subchannel};
use crate::tag::{write_item, TAG_DETI, TAG_PTR};
use crate::time::FrameTimestamp;

/// TSTA ticks elapsed per 24 ms frame, rounded to whole upper-24-bit ticks.
pub const TSTA_PER_FRAME: u32 = 393;

/// Builds a complete TAG payload: `*ptr`, `deti`, then one `est<n>` item per
/// subchannel.
pub fn build_tag_payload(deti: &DetiData, subchannels: &[Subchannel]) -> Vec<u8> {
    let mut payload = Vec::new();
    let mut ptr = Vec::new();
    ptr.extend_from_slice(&crate::decoder::PROTOCOL_DETI);
    ptr.extend_from_slice(&0u16.to_be_bytes());
    ptr.extend_from_slice(&0u16.to_be_bytes());
    write_item(&mut payload, TAG_PTR, &ptr);
    write_item(&mut payload, TAG_DETI, &encode_deti(deti));
    for sub in subchannels {
        let (name, value) = encode_est(sub);
        write_item(&mut payload, name, &value);
    }
    payload
}

/// A `deti` item with a valid timestamp and no FIC.
pub fn sample_deti(dlfc: u16) -> DetiData {
    DetiData {
        fc: FrameCharacterisation { dlfc, fp: 0, mid: 1, ficf: false, tsta: 0x4000 },
        stat: 0xFF,
        mnsc: 0,
        rfu: None,
        timestamp: Some(FrameTimestamp { seconds: 800_000_000, utco: 37, tsta: 0x4000 }),
        fic: None,
    }
}

/// A `deti` item stamped with the given wall-clock-ish timestamp, advancing
/// `dlfc` and `tsta` the way a live 24 ms cadence would.
pub fn timed_deti(dlfc: u16, timestamp: FrameTimestamp) -> DetiData {
    DetiData {
        fc: FrameCharacterisation { dlfc, fp: (dlfc % 8) as u8 & 0x07, mid: 1, ficf: false, tsta: timestamp.tsta },
        stat: 0xFF,
        mnsc: 0,
        rfu: None,
        timestamp: Some(timestamp),
        fic: None,
    }
}

/// A complete AF packet around the given `deti` and subchannels.
pub fn build_af_packet(deti: &DetiData, subchannels: &[Subchannel], seq: u16) -> Vec<u8> {
    af::build(&build_tag_payload(deti, subchannels), seq)
}
