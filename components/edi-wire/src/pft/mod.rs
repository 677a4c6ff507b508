//! PFT (Protection, Fragmentation, Transport) layer framing.
//!
//! Each fragment carries a header closed by a CRC-16:
//!
//! `"PF" | PSEQ(2) | FINDEX(3) | FCOUNT(3) | FEC(1b)+ADDR(1b)+PLEN(14b) |
//!  [RSK(1) RSZ(1)] | [SOURCE(2) DEST(2)] | HCRC(2)`
//!
//! followed by `PLEN` payload bytes. The base header (no optional fields)
//! is 14 bytes; all fields are big-endian.

pub mod assembler;

use crate::crc::crc16;
use thiserror::Error;

pub const PFT_SYNC: [u8; 2] = *b"PF";
/// Header length without optional fields, CRC included.
pub const PFT_BASE_HEADER_LEN: usize = 14;

const FIXED_PART_LEN: usize = 12;
const HCRC_LEN: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PftError {
    #[error("pft fragment truncated")]
    Truncated,
    #[error("bad pft sync bytes")]
    BadSync,
    #[error("pft header crc mismatch")]
    HeaderCrcMismatch,
    #[error("pft fragment count is zero")]
    BadFragmentCount,
    #[error("pft fragment index {findex} out of range for fcount {fcount}")]
    BadFragmentIndex { findex: u32, fcount: u32 },
    #[error("pft fec geometry k={k} z={z} does not match fcount {fcount}")]
    BadFecGeometry { k: u8, z: u8, fcount: u32 },
    #[error("reed-solomon recovery failed: {0}")]
    RsRecovery(String),
}

/// Reed-Solomon geometry of a protected group: `k` data shards followed by
/// `z` parity shards, all `plen` bytes long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsParams {
    pub k: u8,
    pub z: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrFields {
    pub source: u16,
    pub dest: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PftHeader {
    pub pseq: u16,
    pub findex: u32,
    pub fcount: u32,
    pub plen: u16,
    pub fec: Option<RsParams>,
    pub addr: Option<AddrFields>,
}

impl PftHeader {
    pub fn header_len(&self) -> usize {
        PFT_BASE_HEADER_LEN
            + if self.fec.is_some() { 2 } else { 0 }
            + if self.addr.is_some() { 4 } else { 0 }
    }

    pub fn fragment_len(&self) -> usize {
        self.header_len() + self.plen as usize
    }

    /// Returns how many leading bytes of `buf` a fragment starting there
    /// would occupy, or `None` while the flag byte is not yet available.
    pub fn required_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < FIXED_PART_LEN {
            return None;
        }
        let flags = u16::from_be_bytes(buf[10..12].try_into().unwrap());
        let fec = flags & 0x8000 != 0;
        let addr = flags & 0x4000 != 0;
        let plen = (flags & 0x3FFF) as usize;
        let header =
            PFT_BASE_HEADER_LEN + if fec { 2 } else { 0 } + if addr { 4 } else { 0 };
        Some(header + plen)
    }

    /// Parses and validates one fragment header; returns the header and its
    /// encoded length. `Truncated` means the caller should wait for more
    /// bytes.
    pub fn parse(buf: &[u8]) -> Result<(PftHeader, usize), PftError> {
        if buf.len() < FIXED_PART_LEN {
            return Err(PftError::Truncated);
        }
        if buf[..2] != PFT_SYNC {
            return Err(PftError::BadSync);
        }
        let pseq = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        let findex = u32::from_be_bytes([0, buf[4], buf[5], buf[6]]);
        let fcount = u32::from_be_bytes([0, buf[7], buf[8], buf[9]]);
        let flags = u16::from_be_bytes(buf[10..12].try_into().unwrap());
        let has_fec = flags & 0x8000 != 0;
        let has_addr = flags & 0x4000 != 0;
        let plen = flags & 0x3FFF;

        let header_len = PFT_BASE_HEADER_LEN
            + if has_fec { 2 } else { 0 }
            + if has_addr { 4 } else { 0 };
        if buf.len() < header_len {
            return Err(PftError::Truncated);
        }

        let mut pos = FIXED_PART_LEN;
        let fec = if has_fec {
            let params = RsParams { k: buf[pos], z: buf[pos + 1] };
            pos += 2;
            Some(params)
        } else {
            None
        };
        let addr = if has_addr {
            let fields = AddrFields {
                source: u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap()),
                dest: u16::from_be_bytes(buf[pos + 2..pos + 4].try_into().unwrap()),
            };
            pos += 4;
            Some(fields)
        } else {
            None
        };

        let stored = u16::from_be_bytes(buf[pos..pos + HCRC_LEN].try_into().unwrap());
        if crc16(&buf[..pos]) != stored {
            return Err(PftError::HeaderCrcMismatch);
        }

        if fcount == 0 {
            return Err(PftError::BadFragmentCount);
        }
        if findex >= fcount {
            return Err(PftError::BadFragmentIndex { findex, fcount });
        }
        if let Some(rs) = fec {
            if rs.k == 0 || rs.k as u32 + rs.z as u32 != fcount {
                return Err(PftError::BadFecGeometry { k: rs.k, z: rs.z, fcount });
            }
        }

        Ok((PftHeader { pseq, findex, fcount, plen, fec, addr }, header_len))
    }

    /// Appends the encoded header to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&PFT_SYNC);
        out.extend_from_slice(&self.pseq.to_be_bytes());
        out.extend_from_slice(&self.findex.to_be_bytes()[1..]);
        out.extend_from_slice(&self.fcount.to_be_bytes()[1..]);
        let mut flags = self.plen & 0x3FFF;
        if self.fec.is_some() {
            flags |= 0x8000;
        }
        if self.addr.is_some() {
            flags |= 0x4000;
        }
        out.extend_from_slice(&flags.to_be_bytes());
        if let Some(rs) = self.fec {
            out.push(rs.k);
            out.push(rs.z);
        }
        if let Some(addr) = self.addr {
            out.extend_from_slice(&addr.source.to_be_bytes());
            out.extend_from_slice(&addr.dest.to_be_bytes());
        }
        let crc = crc16(&out[start..]);
        out.extend_from_slice(&crc.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(fec: Option<RsParams>, addr: Option<AddrFields>) -> PftHeader {
        PftHeader { pseq: 42, findex: 2, fcount: 5, plen: 100, fec, addr }
    }

    #[test]
    fn roundtrip_plain() {
        let h = header(None, None);
        let mut buf = Vec::new();
        h.write(&mut buf);
        assert_eq!(buf.len(), PFT_BASE_HEADER_LEN);
        buf.extend_from_slice(&[0u8; 100]);
        let (parsed, len) = PftHeader::parse(&buf).expect("parse");
        assert_eq!(parsed, h);
        assert_eq!(len, PFT_BASE_HEADER_LEN);
        assert_eq!(PftHeader::required_len(&buf), Some(PFT_BASE_HEADER_LEN + 100));
    }

    #[test]
    fn roundtrip_with_optional_fields() {
        let h = PftHeader {
            fcount: 7,
            fec: Some(RsParams { k: 4, z: 3 }),
            addr: Some(AddrFields { source: 1, dest: 2 }),
            ..header(None, None)
        };
        let mut buf = Vec::new();
        h.write(&mut buf);
        assert_eq!(buf.len(), PFT_BASE_HEADER_LEN + 6);
        let (parsed, len) = PftHeader::parse(&buf).expect("parse");
        assert_eq!(parsed, h);
        assert_eq!(len, PFT_BASE_HEADER_LEN + 6);
    }

    #[test]
    fn corrupt_header_rejected() {
        let mut buf = Vec::new();
        header(None, None).write(&mut buf);
        buf[3] ^= 0x01;
        assert_eq!(PftHeader::parse(&buf).unwrap_err(), PftError::HeaderCrcMismatch);
    }

    #[test]
    fn geometry_validated() {
        let mut buf = Vec::new();
        let h = PftHeader { fec: Some(RsParams { k: 4, z: 4 }), ..header(None, None) };
        h.write(&mut buf);
        assert!(matches!(PftHeader::parse(&buf), Err(PftError::BadFecGeometry { .. })));

        let mut buf = Vec::new();
        PftHeader { findex: 9, ..header(None, None) }.write(&mut buf);
        assert!(matches!(PftHeader::parse(&buf), Err(PftError::BadFragmentIndex { .. })));
    }

    #[test]
    fn truncated_header_waits() {
        let mut buf = Vec::new();
        header(None, None).write(&mut buf);
        assert_eq!(PftHeader::parse(&buf[..8]).unwrap_err(), PftError::Truncated);
        assert_eq!(PftHeader::required_len(&buf[..8]), None);
    }
}
