//! `deti` and `est<n>` TAG item codecs.
//!
//! `deti` layout:
//!
//! ```text
//! u16: ATSTF(1) | FICF(1) | RFUDF(1) | DLFC(13)
//! u8:  STAT
//! u8:  MID(2) | FP(3) | rfa(3)
//! u16: MNSC
//! ATSTF ? { UTCO(1), SECONDS(4), TSTA(4) }
//! RFUDF ? { RFU(2) }
//! FICF  ? { FIC bytes (128 when MID == 3, else 96) }
//! ```
//!
//! `est<n>` items carry the name `b"est"` plus a binary stream index byte,
//! and a 3-byte packed `SCID(7) | SAD(10) | TPL(6) | rfa(1)` header before
//! the MST data.

use super::{TagError, TagName, EST_PREFIX};
use crate::time::FrameTimestamp;

pub const DLFC_MODULUS: u16 = 5000;
pub const MAX_SUBCHANNELS: usize = 64;

const DETI_NAME: TagName = TagName(*b"deti");

/// Frame characterisation carried by `deti`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCharacterisation {
    /// Data logical frame count, cyclic mod 5000.
    pub dlfc: u16,
    /// Frame phase.
    pub fp: u8,
    /// Mode identifier, 1..=4.
    pub mid: u8,
    /// FIC present.
    pub ficf: bool,
    /// Sub-second timestamp, also repeated in the ETI TIST field.
    pub tsta: u32,
}

impl FrameCharacterisation {
    pub fn fct(&self) -> u8 {
        (self.dlfc % 250) as u8
    }
}

/// Fully decoded `deti` item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetiData {
    pub fc: FrameCharacterisation,
    pub stat: u8,
    pub mnsc: u16,
    pub rfu: Option<u16>,
    pub timestamp: Option<FrameTimestamp>,
    pub fic: Option<Vec<u8>>,
}

impl DetiData {
    pub fn timestamp_or_invalid(&self) -> FrameTimestamp {
        self.timestamp.unwrap_or_default()
    }
}

/// One stream component decoded from an `est<n>` item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subchannel {
    pub stream_index: u8,
    pub scid: u8,
    pub sad: u16,
    pub tpl: u8,
    pub mst: Vec<u8>,
}

impl Subchannel {
    /// Stream length in 64-bit words, as carried in the ETI STC entry.
    pub fn stl(&self) -> u16 {
        (self.mst.len() / 8) as u16
    }
}

pub fn fic_len(mid: u8) -> usize {
    if mid == 3 {
        128
    } else {
        96
    }
}

pub fn decode_deti(value: &[u8]) -> Result<DetiData, TagError> {
    let mut reader = FieldReader::new(DETI_NAME, value);
    let head = reader.read_u16("head")?;
    let atstf = head & 0x8000 != 0;
    let ficf = head & 0x4000 != 0;
    let rfudf = head & 0x2000 != 0;
    let dlfc = head & 0x1FFF;
    if dlfc >= DLFC_MODULUS {
        return Err(TagError::InvalidField(DETI_NAME, "dlfc"));
    }
    let stat = reader.read_u8("stat")?;
    let packed = reader.read_u8("mid_fp")?;
    // transmission mode 4 travels as 0b00 in the two-bit field
    let mid = match (packed >> 6) & 0x03 {
        0 => 4,
        mid => mid,
    };
    let fp = (packed >> 3) & 0x07;
    let mnsc = reader.read_u16("mnsc")?;

    let timestamp = if atstf {
        let utco = reader.read_u8("utco")?;
        let seconds = reader.read_u32("seconds")?;
        let tsta = reader.read_u32("tsta")?;
        Some(FrameTimestamp { seconds, utco, tsta })
    } else {
        None
    };
    let rfu = if rfudf { Some(reader.read_u16("rfu")?) } else { None };
    let fic = if ficf { Some(reader.read_bytes("fic", fic_len(mid))?.to_vec()) } else { None };
    reader.expect_finished()?;

    let tsta = timestamp.map(|ts| ts.tsta).unwrap_or(0xFFFFFF00);
    Ok(DetiData { fc: FrameCharacterisation { dlfc, fp, mid, ficf, tsta }, stat, mnsc, rfu, timestamp, fic })
}

pub fn encode_deti(deti: &DetiData) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + deti.fic.as_ref().map_or(0, Vec::len));
    let mut head = deti.fc.dlfc & 0x1FFF;
    if deti.timestamp.is_some() {
        head |= 0x8000;
    }
    if deti.fic.is_some() {
        head |= 0x4000;
    }
    if deti.rfu.is_some() {
        head |= 0x2000;
    }
    out.extend_from_slice(&head.to_be_bytes());
    out.push(deti.stat);
    out.push(((deti.fc.mid & 0x03) << 6) | ((deti.fc.fp & 0x07) << 3));
    out.extend_from_slice(&deti.mnsc.to_be_bytes());
    if let Some(ts) = deti.timestamp {
        out.push(ts.utco);
        out.extend_from_slice(&ts.seconds.to_be_bytes());
        out.extend_from_slice(&ts.tsta.to_be_bytes());
    }
    if let Some(rfu) = deti.rfu {
        out.extend_from_slice(&rfu.to_be_bytes());
    }
    if let Some(fic) = &deti.fic {
        out.extend_from_slice(fic);
    }
    out
}

pub fn decode_est(name: [u8; 4], value: &[u8]) -> Result<Subchannel, TagError> {
    debug_assert_eq!(name[..3], EST_PREFIX);
    let tag = TagName(name);
    let stream_index = name[3];
    if stream_index == 0 || stream_index as usize > MAX_SUBCHANNELS {
        return Err(TagError::InvalidField(tag, "stream_index"));
    }
    let mut reader = FieldReader::new(tag, value);
    let packed = reader.read_bytes("sstc", 3)?;
    let word = u32::from_be_bytes([0, packed[0], packed[1], packed[2]]);
    let scid = ((word >> 17) & 0x7F) as u8;
    let sad = ((word >> 7) & 0x3FF) as u16;
    let tpl = ((word >> 1) & 0x3F) as u8;
    let mst = reader.take_rest().to_vec();
    Ok(Subchannel { stream_index, scid, sad, tpl, mst })
}

pub fn encode_est(subchannel: &Subchannel) -> ([u8; 4], Vec<u8>) {
    let name = [EST_PREFIX[0], EST_PREFIX[1], EST_PREFIX[2], subchannel.stream_index];
    let word: u32 = ((subchannel.scid as u32 & 0x7F) << 17)
        | ((subchannel.sad as u32 & 0x3FF) << 7)
        | ((subchannel.tpl as u32 & 0x3F) << 1);
    let mut value = Vec::with_capacity(3 + subchannel.mst.len());
    value.extend_from_slice(&word.to_be_bytes()[1..]);
    value.extend_from_slice(&subchannel.mst);
    (name, value)
}

/// Bounds-checked field reader with labelled errors.
struct FieldReader<'a> {
    tag: TagName,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(tag: TagName, buf: &'a [u8]) -> Self {
        Self { tag, buf, pos: 0 }
    }

    fn read_bytes(&mut self, label: &'static str, len: usize) -> Result<&'a [u8], TagError> {
        if self.pos + len > self.buf.len() {
            return Err(TagError::PayloadTooShort(self.tag, label));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_u8(&mut self, label: &'static str) -> Result<u8, TagError> {
        Ok(self.read_bytes(label, 1)?[0])
    }

    fn read_u16(&mut self, label: &'static str) -> Result<u16, TagError> {
        Ok(u16::from_be_bytes(self.read_bytes(label, 2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self, label: &'static str) -> Result<u32, TagError> {
        Ok(u32::from_be_bytes(self.read_bytes(label, 4)?.try_into().unwrap()))
    }

    fn take_rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn expect_finished(&self) -> Result<(), TagError> {
        if self.pos != self.buf.len() {
            Err(TagError::InvalidField(self.tag, "trailing_bytes"))
        } else {
            Ok(())
        }
    }
}
