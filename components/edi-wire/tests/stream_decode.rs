//! Decoding a mixed stream of raw AF packets and PFT fragment groups, with
//! losses, corruption and awkward chunk boundaries.

use edi_wire::af;
use edi_wire::fixtures::{build_af_packet, sample_deti, timed_deti};
use edi_wire::pft::{PftHeader, RsParams};
use edi_wire::tag::deti::Subchannel;
use edi_wire::time::FrameTimestamp;
use edi_wire::EdiDecoder;
use reed_solomon_erasure::galois_8::ReedSolomon;

fn subchannel() -> Subchannel {
    Subchannel { stream_index: 2, scid: 8, sad: 0x155, tpl: 0x2A, mst: vec![0xC3; 96] }
}

fn af_packet(dlfc: u16) -> Vec<u8> {
    let timestamp = FrameTimestamp { seconds: 790_000_000 + dlfc as u32, utco: 37, tsta: (dlfc as u32) << 8 };
    build_af_packet(&timed_deti(dlfc, timestamp), &[subchannel()], dlfc)
}

fn plain_fragments(packet: &[u8], pseq: u16, chunk: usize) -> Vec<Vec<u8>> {
    let fcount = packet.len().div_ceil(chunk) as u32;
    packet
        .chunks(chunk)
        .enumerate()
        .map(|(findex, chunk)| {
            let header = PftHeader {
                pseq,
                findex: findex as u32,
                fcount,
                plen: chunk.len() as u16,
                fec: None,
                addr: None,
            };
            let mut fragment = Vec::new();
            header.write(&mut fragment);
            fragment.extend_from_slice(chunk);
            fragment
        })
        .collect()
}

fn protected_fragments(packet: &[u8], pseq: u16, k: usize, z: usize) -> Vec<Vec<u8>> {
    let plen = packet.len().div_ceil(k);
    let mut shards: Vec<Vec<u8>> = packet
        .chunks(plen)
        .map(|chunk| {
            let mut shard = chunk.to_vec();
            shard.resize(plen, 0);
            shard
        })
        .collect();
    shards.extend(std::iter::repeat_with(|| vec![0u8; plen]).take(z));
    ReedSolomon::new(k, z).unwrap().encode(&mut shards).unwrap();
    shards
        .into_iter()
        .enumerate()
        .map(|(findex, shard)| {
            let header = PftHeader {
                pseq,
                findex: findex as u32,
                fcount: (k + z) as u32,
                plen: plen as u16,
                fec: Some(RsParams { k: k as u8, z: z as u8 }),
                addr: None,
            };
            let mut fragment = Vec::new();
            header.write(&mut fragment);
            fragment.extend_from_slice(&shard);
            fragment
        })
        .collect()
}

#[test]
fn mixed_stream_in_odd_chunks() {
    let mut stream = Vec::new();
    // raw AF, then a plain PFT group, then an FEC group missing fragments,
    // separated by line noise
    stream.extend_from_slice(&af_packet(10));
    stream.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    for fragment in plain_fragments(&af_packet(11), 70, 59) {
        stream.extend_from_slice(&fragment);
    }
    for (i, fragment) in protected_fragments(&af_packet(12), 71, 6, 2).into_iter().enumerate() {
        if i == 1 || i == 4 {
            continue; // two losses, exactly as many as there are parity shards
        }
        stream.extend_from_slice(&fragment);
    }
    stream.extend_from_slice(&af_packet(13));

    let mut decoder = EdiDecoder::new();
    let mut frames = Vec::new();
    for chunk in stream.chunks(7) {
        frames.extend(decoder.push_bytes(chunk));
    }

    let dlfcs: Vec<u16> = frames.iter().map(|f| f.deti.fc.dlfc).collect();
    assert_eq!(dlfcs, vec![10, 11, 12, 13]);
    assert!(decoder.stats().resync_skipped >= 4);
    for frame in &frames {
        assert_eq!(frame.subchannels.len(), 1);
        assert_eq!(frame.subchannels[0].mst, subchannel().mst);
        assert!(af::parse(&frame.afpacket).is_ok());
    }
    // PFT-delivered frames carry their transport sequence
    assert!(!frames[0].seq.pseq_valid);
    assert!(frames[1].seq.pseq_valid);
    assert_eq!(frames[1].seq.pseq, 70);
    assert_eq!(frames[2].seq.pseq, 71);
}

#[test]
fn interleaved_groups_complete_independently() {
    let packet_a = af_packet(20);
    let packet_b = af_packet(21);
    let frags_a = plain_fragments(&packet_a, 80, 100);
    let frags_b = plain_fragments(&packet_b, 81, 100);

    let mut decoder = EdiDecoder::new();
    let mut frames = Vec::new();
    let max = frags_a.len().max(frags_b.len());
    for i in 0..max {
        if let Some(fragment) = frags_a.get(i) {
            frames.extend(decoder.push_bytes(fragment));
        }
        if let Some(fragment) = frags_b.get(i) {
            frames.extend(decoder.push_bytes(fragment));
        }
    }
    let dlfcs: Vec<u16> = frames.iter().map(|f| f.deti.fc.dlfc).collect();
    assert_eq!(dlfcs.len(), 2);
    assert!(dlfcs.contains(&20) && dlfcs.contains(&21));
}

#[test]
fn corrupted_fragment_does_not_poison_the_stream() {
    let mut fragments = plain_fragments(&af_packet(30), 90, 80);
    // flip a payload byte of the first fragment: the group completes but the
    // AF CRC rejects the reassembled packet
    let header_len = PftHeader::parse(&fragments[0]).unwrap().1;
    fragments[0][header_len + 10] ^= 0xFF;

    let mut stream = Vec::new();
    for fragment in &fragments {
        stream.extend_from_slice(fragment);
    }
    stream.extend_from_slice(&af_packet(31));

    let mut decoder = EdiDecoder::new();
    let frames = decoder.push_bytes(&stream);
    let dlfcs: Vec<u16> = frames.iter().map(|f| f.deti.fc.dlfc).collect();
    assert_eq!(dlfcs, vec![31]);
    assert_eq!(decoder.stats().af_errors, 1);
}

#[test]
fn sample_deti_fixture_is_well_formed() {
    let packet = build_af_packet(&sample_deti(1), &[], 1);
    let mut decoder = EdiDecoder::new();
    assert_eq!(decoder.push_packet(&packet).len(), 1);
}
