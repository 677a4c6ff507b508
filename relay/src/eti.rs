//! ETI frame reconstruction and the four-frame sideband framing.
//!
//! A reconstructed frame is at most 6144 bytes:
//!
//! `ERR(1) | FSYNC(3) | FC(4) | STC(4·NST) | EOH{MNSC(2) CRC(2)} |
//!  MST{FIC, subchannel data} | EOF{CRC(2) RFU(2)} | TIST(4)`
//!
//! Four frames are concatenated per sideband message so the downstream
//! transmitter keeps its transmission-multiplex phase; the message head is
//! `version: u32 = 1` plus four `i16` frame lengths (unused slots `-1`),
//! little-endian.

use bytes::Bytes;
use edi_wire::crc::crc16;
use edi_wire::DecodedFrame;
use thiserror::Error;

pub const ETI_FRAME_CAPACITY: usize = 6144;
pub const FRAMES_PER_MESSAGE: usize = 4;
const MESSAGE_VERSION: u32 = 1;

const FSYNC_EVEN: [u8; 3] = [0xF8, 0xC5, 0x49];
const FSYNC_ODD: [u8; 3] = [0x07, 0x3A, 0xB6];

#[derive(Debug, Error)]
pub enum EtiError {
    #[error("frame carries no FIC but reconstruction needs one")]
    MissingFic,
    #[error("reconstructed frame of {0} bytes exceeds the ETI frame capacity")]
    FrameTooLarge(usize),
    #[error("unexpected frame phase {got}, waiting for {expected}")]
    UnexpectedFramePhase { expected: u8, got: u8 },
}

/// Rebuilds the raw ETI frame from one decoded AF packet.
pub fn reconstruct_frame(frame: &DecodedFrame) -> Result<Vec<u8>, EtiError> {
    let deti = &frame.deti;
    let Some(fic) = &deti.fic else {
        return Err(EtiError::MissingFic);
    };

    let nst = frame.subchannels.len();
    let mst_len: usize = fic.len() + frame.subchannels.iter().map(|s| s.mst.len()).sum::<usize>();
    let total = 1 + 3 + 4 + 4 * nst + 4 + mst_len + 4 + 4;
    if total > ETI_FRAME_CAPACITY {
        return Err(EtiError::FrameTooLarge(total));
    }

    let mut out = Vec::with_capacity(total);
    out.push(deti.stat);
    let fct = deti.fc.fct();
    out.extend_from_slice(if fct % 2 == 0 { &FSYNC_EVEN } else { &FSYNC_ODD });

    // FL counts STC, EOH and MST in 32-bit words
    let fl: u16 = (nst + 1 + mst_len / 4) as u16;
    out.push(fct);
    out.push(((deti.fc.ficf as u8) << 7) | (nst as u8 & 0x7F));
    out.push((deti.fc.fp << 5) | ((deti.fc.mid & 0x03) << 3) | ((fl >> 8) as u8 & 0x07));
    out.push((fl & 0xFF) as u8);

    for sub in &frame.subchannels {
        let stl = sub.stl();
        out.push((sub.scid << 2) | ((sub.sad >> 8) as u8 & 0x03));
        out.push((sub.sad & 0xFF) as u8);
        out.push((sub.tpl << 2) | ((stl >> 8) as u8 & 0x03));
        out.push((stl & 0xFF) as u8);
    }

    out.extend_from_slice(&deti.mnsc.to_be_bytes());
    // EOH CRC covers FC, STC and MNSC
    let header_crc = crc16(&out[4..]);
    out.extend_from_slice(&header_crc.to_be_bytes());

    let mst_start = out.len();
    out.extend_from_slice(fic);
    for sub in &frame.subchannels {
        out.extend_from_slice(&sub.mst);
    }
    let mst_crc = crc16(&out[mst_start..]);
    out.extend_from_slice(&mst_crc.to_be_bytes());
    out.extend_from_slice(&deti.rfu.unwrap_or(0xFFFF).to_be_bytes());
    out.extend_from_slice(&deti.fc.tsta.to_be_bytes());
    Ok(out)
}

/// Groups reconstructed frames into four-frame messages, releasing one only
/// when the frame phases line up.
pub struct EtiMux {
    expected_fp: u8,
    frames: Vec<Vec<u8>>,
    sink: Box<dyn FnMut(Bytes) + Send>,
}

impl EtiMux {
    pub fn new(sink: impl FnMut(Bytes) + Send + 'static) -> Self {
        Self { expected_fp: 0, frames: Vec::with_capacity(FRAMES_PER_MESSAGE), sink: Box::new(sink) }
    }

    /// Accepts the next reconstructed frame. Frames arriving before phase 0
    /// is reached are skipped; a phase jump mid-group is an error and resets
    /// the group.
    pub fn push_frame(&mut self, frame: Vec<u8>, fp: u8) -> Result<(), EtiError> {
        if fp % 4 != self.expected_fp {
            if self.expected_fp == 0 {
                return Ok(());
            }
            let expected = self.expected_fp;
            self.expected_fp = 0;
            self.frames.clear();
            return Err(EtiError::UnexpectedFramePhase { expected, got: fp % 4 });
        }
        self.frames.push(frame);
        self.expected_fp = (self.expected_fp + 1) % 4;
        if self.expected_fp == 0 {
            self.flush();
        }
        Ok(())
    }

    fn flush(&mut self) {
        let mut lengths = [-1i16; FRAMES_PER_MESSAGE];
        let payload_len: usize = self.frames.iter().map(Vec::len).sum();
        let mut message = Vec::with_capacity(4 + 2 * FRAMES_PER_MESSAGE + payload_len);
        message.extend_from_slice(&MESSAGE_VERSION.to_le_bytes());
        for (slot, frame) in lengths.iter_mut().zip(&self.frames) {
            *slot = frame.len() as i16;
        }
        for length in lengths {
            message.extend_from_slice(&length.to_le_bytes());
        }
        for frame in self.frames.drain(..) {
            message.extend_from_slice(&frame);
        }
        (self.sink)(Bytes::from(message));
    }
}
