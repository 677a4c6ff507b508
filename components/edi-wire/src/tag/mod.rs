//! TAG item framing inside an AF payload.
//!
//! Each item is a 4-byte ASCII name, a 32-bit length in bits, then the value
//! padded to byte alignment.

pub mod deti;

use thiserror::Error;

pub const TAG_PTR: [u8; 4] = *b"*ptr";
pub const TAG_DETI: [u8; 4] = *b"deti";
pub const TAG_DMY: [u8; 4] = *b"*dmy";
pub const EST_PREFIX: [u8; 3] = *b"est";

const ITEM_HEADER_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("tag item truncated")]
    Truncated,
    #[error("tag {0} payload too short at {1}")]
    PayloadTooShort(TagName, &'static str),
    #[error("tag {0} has invalid field {1}")]
    InvalidField(TagName, &'static str),
    #[error("deti item seen before *ptr")]
    DetiBeforePtr,
    #[error("unsupported protocol {0}")]
    UnsupportedProtocol(TagName),
}

/// Printable wrapper for 4-byte tag names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagName(pub [u8; 4]);

impl std::fmt::Display for TagName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TagItem<'a> {
    pub name: [u8; 4],
    pub value: &'a [u8],
}

impl<'a> TagItem<'a> {
    pub fn is_est(&self) -> bool {
        self.name[..3] == EST_PREFIX
    }
}

/// Iterator over the TAG items of an AF payload.
pub struct TagWalker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TagWalker<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for TagWalker<'a> {
    type Item = Result<TagItem<'a>, TagError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.buf.len() {
            return None;
        }
        let rest = &self.buf[self.pos..];
        if rest.len() < ITEM_HEADER_LEN {
            self.pos = self.buf.len();
            return Some(Err(TagError::Truncated));
        }
        let name: [u8; 4] = rest[..4].try_into().unwrap();
        let len_bits = u32::from_be_bytes(rest[4..8].try_into().unwrap());
        let len_bytes = (len_bits as usize + 7) / 8;
        if rest.len() < ITEM_HEADER_LEN + len_bytes {
            self.pos = self.buf.len();
            return Some(Err(TagError::Truncated));
        }
        let value = &rest[ITEM_HEADER_LEN..ITEM_HEADER_LEN + len_bytes];
        self.pos += ITEM_HEADER_LEN + len_bytes;
        Some(Ok(TagItem { name, value }))
    }
}

/// Appends one TAG item to `out`.
pub fn write_item(out: &mut Vec<u8>, name: [u8; 4], value: &[u8]) {
    out.extend_from_slice(&name);
    out.extend_from_slice(&((value.len() as u32) * 8).to_be_bytes());
    out.extend_from_slice(value);
}

/// Pads a TAG packet with `*dmy` items until its length is a multiple of
/// `alignment`. A `*dmy` item needs at least its 8 header bytes, so short
/// remainders are covered by overshooting one alignment step.
pub fn pad_to_alignment(out: &mut Vec<u8>, alignment: usize) {
    if alignment < 2 || out.len() % alignment == 0 {
        return;
    }
    let mut target = out.len().div_ceil(alignment) * alignment;
    while target - out.len() < ITEM_HEADER_LEN {
        target += alignment;
    }
    let value_len = target - out.len() - ITEM_HEADER_LEN;
    write_item(out, TAG_DMY, &vec![0u8; value_len]);
}
