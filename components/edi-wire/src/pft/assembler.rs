//! Reassembly of AF packets from PFT fragment groups.

use super::{PftError, PftHeader, RsParams};
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct PftAssemblerConfig {
    /// Maximum number of concurrently tracked fragment groups.
    pub max_groups: usize,
    /// Group lifetime, counted in completed AF packets (one packet spans
    /// roughly 24 ms of stream time).
    pub max_delay: u64,
}

impl Default for PftAssemblerConfig {
    fn default() -> Self {
        Self { max_groups: 16, max_delay: 10 }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PftAssemblerStats {
    /// Groups abandoned incomplete after `max_delay` AF packet durations.
    pub expired_groups: u64,
    /// Groups evicted to make room for newer ones.
    pub evicted_groups: u64,
    /// Fragments discarded because the index was already present.
    pub duplicate_fragments: u64,
    /// Fragments discarded because they disagreed with their group geometry.
    pub mismatched_fragments: u64,
    /// Protected groups where Reed-Solomon recovery failed.
    pub recovery_failures: u64,
}

#[derive(Debug)]
struct GroupState {
    fcount: u32,
    plen: u16,
    rs: Option<RsParams>,
    fragments: BTreeMap<u32, Vec<u8>>,
    born_at_af: u64,
}

impl GroupState {
    fn is_complete(&self) -> bool {
        let needed = match self.rs {
            Some(rs) => rs.k as usize,
            None => self.fcount as usize,
        };
        self.fragments.len() >= needed
    }
}

/// Groups incoming fragments by `pseq` and emits the reassembled AF packet
/// once enough of a group has been seen. Group age is measured against the
/// count of AF packets completed by the surrounding decoder, so the bound
/// tracks stream time rather than wall time.
#[derive(Debug)]
pub struct PftAssembler {
    config: PftAssemblerConfig,
    groups: HashMap<u16, GroupState>,
    order: VecDeque<u16>,
    af_counter: u64,
    stats: PftAssemblerStats,
}

impl PftAssembler {
    pub fn new(config: PftAssemblerConfig) -> Self {
        Self { config, groups: HashMap::new(), order: VecDeque::new(), af_counter: 0, stats: PftAssemblerStats::default() }
    }

    pub fn stats(&self) -> PftAssemblerStats {
        self.stats
    }

    /// Ingests one validated fragment. Returns the reassembled AF packet
    /// when the fragment completes its group.
    pub fn ingest(&mut self, header: &PftHeader, payload: &[u8]) -> Result<Option<Vec<u8>>, PftError> {
        if header.fcount == 1 && header.fec.is_none() {
            return Ok(Some(payload.to_vec()));
        }

        let pseq = header.pseq;
        let is_new = !self.groups.contains_key(&pseq);
        if is_new {
            self.evict_for_capacity();
            self.groups.insert(
                pseq,
                GroupState {
                    fcount: header.fcount,
                    plen: header.plen,
                    rs: header.fec,
                    fragments: BTreeMap::new(),
                    born_at_af: self.af_counter,
                },
            );
            self.order.push_back(pseq);
        }

        let group = self.groups.get_mut(&pseq).expect("group just ensured");
        if group.fcount != header.fcount || group.rs != header.fec {
            self.stats.mismatched_fragments += 1;
            return Ok(None);
        }
        if group.rs.is_some() && payload.len() != group.plen as usize {
            self.stats.mismatched_fragments += 1;
            return Ok(None);
        }
        if group.fragments.contains_key(&header.findex) {
            self.stats.duplicate_fragments += 1;
            return Ok(None);
        }
        group.fragments.insert(header.findex, payload.to_vec());

        if !group.is_complete() {
            return Ok(None);
        }

        let group = self.groups.remove(&pseq).expect("complete group present");
        self.order.retain(|&p| p != pseq);
        let assembled = match group.rs {
            None => {
                let mut out = Vec::new();
                for fragment in group.fragments.values() {
                    out.extend_from_slice(fragment);
                }
                out
            }
            Some(rs) => match recover_protected(&group, rs) {
                Ok(out) => out,
                Err(err) => {
                    self.stats.recovery_failures += 1;
                    return Err(err);
                }
            },
        };
        Ok(Some(assembled))
    }

    /// Advances the AF packet clock and drops groups that outlived
    /// `max_delay`. Called by the decoder after each completed AF packet.
    pub fn on_af_packet(&mut self) {
        self.af_counter += 1;
        while let Some(&pseq) = self.order.front() {
            let expired = match self.groups.get(&pseq) {
                Some(group) => self.af_counter - group.born_at_af > self.config.max_delay,
                None => true,
            };
            if !expired {
                break;
            }
            self.order.pop_front();
            if self.groups.remove(&pseq).is_some() {
                self.stats.expired_groups += 1;
                log::warn!("abandoning incomplete PFT group pseq={pseq}");
            }
        }
    }

    /// Drops all partial state, e.g. when the transport reconnects.
    pub fn reset(&mut self) {
        self.groups.clear();
        self.order.clear();
    }

    fn evict_for_capacity(&mut self) {
        while self.groups.len() >= self.config.max_groups.max(1) {
            let Some(pseq) = self.order.pop_front() else { break };
            if self.groups.remove(&pseq).is_some() {
                self.stats.evicted_groups += 1;
                log::warn!("evicting PFT group pseq={pseq} to bound reassembly state");
            }
        }
    }
}

fn recover_protected(group: &GroupState, rs: RsParams) -> Result<Vec<u8>, PftError> {
    let total = rs.k as usize + rs.z as usize;
    let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
    for (&index, fragment) in &group.fragments {
        shards[index as usize] = Some(fragment.clone());
    }
    let codec = ReedSolomon::new(rs.k as usize, rs.z as usize)
        .map_err(|e| PftError::RsRecovery(e.to_string()))?;
    codec.reconstruct_data(&mut shards).map_err(|e| PftError::RsRecovery(e.to_string()))?;
    let mut out = Vec::with_capacity(rs.k as usize * group.plen as usize);
    for shard in shards.into_iter().take(rs.k as usize) {
        out.extend_from_slice(&shard.expect("data shard reconstructed"));
    }
    Ok(out)
}
