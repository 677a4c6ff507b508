pub mod af;
pub mod crc;
pub mod decoder;
pub mod fixtures;
pub mod pft;
pub mod tag;
pub mod time;

pub use decoder::{DecodedFrame, DecoderStats, EdiDecoder, SeqInfo, PROTOCOL_DETI};
pub use tag::deti::{DetiData, FrameCharacterisation, Subchannel, DLFC_MODULUS};
pub use time::FrameTimestamp;
