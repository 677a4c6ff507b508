//! AF packet fragmentation for PFT-enabled destinations.

use crate::{OutputError, PftSettings};
use edi_wire::pft::{PftHeader, RsParams};
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Splits one AF packet into PFT fragments.
///
/// Without FEC, the packet is cut into payload-capped chunks emitted in
/// `findex` order; with `fec = z > 0`, the packet is cut into `k` equal
/// shards (zero-padded at the tail) and `z` Reed-Solomon parity shards are
/// appended, so any `k` of the `k + z` fragments recover the packet. The
/// AF length field bounds the payload, so the receiver never sees the
/// padding.
pub fn fragment_af(af: &[u8], pseq: u16, settings: &PftSettings) -> Result<Vec<Vec<u8>>, OutputError> {
    let cap = settings.max_fragment_payload.min(0x3FFF);
    if cap == 0 {
        return Err(OutputError::TooLarge { len: af.len(), max: 0 });
    }

    if settings.fec == 0 {
        let fcount = af.len().div_ceil(cap).max(1) as u32;
        let mut fragments = Vec::with_capacity(fcount as usize);
        for (findex, chunk) in af.chunks(cap).enumerate() {
            let header = PftHeader {
                pseq,
                findex: findex as u32,
                fcount,
                plen: chunk.len() as u16,
                fec: None,
                addr: None,
            };
            let mut fragment = Vec::with_capacity(header.fragment_len());
            header.write(&mut fragment);
            fragment.extend_from_slice(chunk);
            fragments.push(fragment);
        }
        return Ok(fragments);
    }

    let k = af.len().div_ceil(cap).max(1);
    if k > u8::MAX as usize {
        return Err(OutputError::TooLarge { len: af.len(), max: cap });
    }
    let z = settings.fec as usize;
    let plen = af.len().div_ceil(k);

    let mut shards: Vec<Vec<u8>> = af
        .chunks(plen)
        .map(|chunk| {
            let mut shard = chunk.to_vec();
            shard.resize(plen, 0);
            shard
        })
        .collect();
    debug_assert_eq!(shards.len(), k);
    shards.extend(std::iter::repeat_with(|| vec![0u8; plen]).take(z));

    ReedSolomon::new(k, z)
        .and_then(|codec| codec.encode(&mut shards))
        .map_err(|e| OutputError::RsEncode(e.to_string()))?;

    let rs = RsParams { k: k as u8, z: z as u8 };
    let fcount = (k + z) as u32;
    let fragments = shards
        .into_iter()
        .enumerate()
        .map(|(findex, shard)| {
            let header = PftHeader {
                pseq,
                findex: findex as u32,
                fcount,
                plen: plen as u16,
                fec: Some(rs),
                addr: None,
            };
            let mut fragment = Vec::with_capacity(header.fragment_len());
            header.write(&mut fragment);
            fragment.extend_from_slice(&shard);
            fragment
        })
        .collect();
    Ok(fragments)
}
