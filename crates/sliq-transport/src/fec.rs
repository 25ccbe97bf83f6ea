//! # FEC Engine
//!
//! Round-based forward error correction for one stream. The sender
//! partitions outbound payloads into groups of `k` source packets. Round
//! one puts the sources on the wire first, then enough coded packets to
//! reach the table-prescribed degrees of freedom. Each later round reacts
//! to what the receiver acknowledged: missing sources are resent ahead of
//! fresh coded packets, again to the table's count. The final round runs
//! against the endgame table.
//!
//! A group retires when all of its sources are acknowledged, when the
//! final round resolves, or when a move-forward overtakes it; retirement
//! abandons whatever is still unacknowledged so the receiver stops
//! waiting.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::seq::PktSeq;
use crate::tables::{self, DofTablePair, MAX_ROUNDS};
use crate::vdm::{encode_coded, CodingMatrix, GroupDecoder, MAX_DOF_INDEX};
use crate::wire::{FecInfo, FecPktType};

/// How a stream expresses its FEC delivery target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecTarget {
    /// Finish within this many transmission rounds (1..=7).
    Rounds(u8),
    /// Finish within this many milliseconds; converted to rounds against
    /// the smoothed RTT when a group starts.
    DeliveryTimeMs(u16),
}

impl FecTarget {
    fn rounds(&self, srtt_us: u64) -> u8 {
        match *self {
            FecTarget::Rounds(n) => n.clamp(1, MAX_ROUNDS),
            FecTarget::DeliveryTimeMs(ms) => {
                let rtt = srtt_us.max(1);
                let n = (ms as u64 * 1_000) / rtt;
                (n as u8).clamp(1, MAX_ROUNDS)
            }
        }
    }
}

/// Sender-side FEC configuration for one stream.
#[derive(Debug, Clone, Copy)]
pub struct FecSenderConfig {
    /// Source packets per group, 1..=10.
    pub group_size: usize,
    pub target: FecTarget,
    /// Target packet receive probability.
    pub tgt_precv: f64,
}

// ─── Outbound Plan ──────────────────────────────────────────────────────────

/// One packet the engine wants on the wire.
#[derive(Debug)]
pub struct FecOutPkt {
    pub info: FecInfo,
    pub payload: Bytes,
    /// Combined source lengths, present on coded packets.
    pub enc_len: Option<u16>,
    /// Set when this is a retransmission of an already sequenced source.
    pub rexmit_of: Option<PktSeq>,
}

/// Group-level outcome of resolving one packet.
#[derive(Debug, PartialEq, Eq)]
pub enum FecFeedback {
    None,
    /// Every packet of the current round is resolved; schedule the next.
    RoundComplete(u16),
    /// The group is done; abandon whatever was never acknowledged.
    Retired { group: u16, unacked: Vec<PktSeq> },
}

// ─── Sender Side ────────────────────────────────────────────────────────────

struct SendGroup {
    k: usize,
    sources: Vec<Bytes>,
    src_seq: Vec<Option<PktSeq>>,
    src_acked: Vec<bool>,
    coded_acked: usize,
    /// Every sequence this group ever put on the wire, with its group
    /// index and ack state.
    seq_state: HashMap<u32, (u8, bool)>,
    /// Sequences of the current round still awaiting ack or loss.
    unresolved: HashSet<u32>,
    round: u8,
    rounds_total: u8,
    next_coded_idx: u8,
    tables: Arc<DofTablePair>,
    retired: bool,
}

impl SendGroup {
    fn src_acked_count(&self) -> usize {
        self.src_acked.iter().filter(|&&a| a).count()
    }

    fn all_sources_acked(&self) -> bool {
        self.src_acked.iter().all(|&a| a)
    }

    fn unacked_seqs(&self) -> Vec<PktSeq> {
        let mut seqs: Vec<PktSeq> = self
            .seq_state
            .iter()
            .filter(|(_, (_, acked))| !acked)
            .map(|(&raw, _)| PktSeq(raw))
            .collect();
        seqs.sort();
        seqs
    }
}

/// Sender-side engine: group formation, round scheduling, feedback.
pub struct FecSender {
    config: FecSenderConfig,
    /// Coding matrices by group size; flushed partial groups are smaller
    /// than the configured size.
    matrices: HashMap<usize, CodingMatrix>,
    pending: Vec<Bytes>,
    groups: BTreeMap<u16, SendGroup>,
    next_group: u16,
}

impl FecSender {
    pub fn new(config: FecSenderConfig) -> Self {
        let k = config.group_size.clamp(1, tables::MAX_SRC_PKTS);
        let mut matrices = HashMap::new();
        matrices.insert(k, CodingMatrix::new(k));
        FecSender {
            config: FecSenderConfig {
                group_size: k,
                ..config
            },
            matrices,
            pending: Vec::with_capacity(k),
            groups: BTreeMap::new(),
            next_group: 0,
        }
    }

    pub fn group_size(&self) -> usize {
        self.config.group_size
    }

    /// Queue a source payload. Returns the sealed group id once the group
    /// fills.
    pub fn push_source(&mut self, payload: Bytes, per: f64, srtt_us: u64) -> Option<u16> {
        self.pending.push(payload);
        if self.pending.len() >= self.config.group_size {
            Some(self.seal(per, srtt_us))
        } else {
            None
        }
    }

    /// Seal a partial group (stream close or delivery deadline).
    pub fn flush(&mut self, per: f64, srtt_us: u64) -> Option<u16> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.seal(per, srtt_us))
        }
    }

    fn seal(&mut self, per: f64, srtt_us: u64) -> u16 {
        let sources = std::mem::take(&mut self.pending);
        let k = sources.len();
        let rounds_total = self.config.target.rounds(srtt_us);
        let tables = tables::dof_tables(per, self.config.tgt_precv, rounds_total, k);
        let id = self.next_group;
        self.next_group = self.next_group.wrapping_add(1);
        debug!(group = id, k, rounds = rounds_total, "sealing fec group");
        self.groups.insert(
            id,
            SendGroup {
                k,
                sources,
                src_seq: vec![None; k],
                src_acked: vec![false; k],
                coded_acked: 0,
                seq_state: HashMap::new(),
                unresolved: HashSet::new(),
                round: 0,
                rounds_total,
                next_coded_idx: k as u8,
                tables,
                retired: false,
            },
        );
        id
    }

    /// Produce the next round's transmissions for a group. Sources (fresh
    /// or resent) come before coded packets.
    pub fn plan_round(&mut self, group_id: u16) -> Vec<FecOutPkt> {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return Vec::new();
        };
        if group.retired || group.round >= group.rounds_total {
            return Vec::new();
        }
        group.round += 1;
        let round = group.round;
        let k = group.k;
        let dof = group
            .tables
            .dof_to_send(group.src_acked_count(), group.coded_acked, round)
            as usize;
        if dof == 0 {
            return Vec::new();
        }

        let mut plan = Vec::with_capacity(dof);
        let missing: Vec<usize> = (0..k).filter(|&i| !group.src_acked[i]).collect();
        let src_to_send = dof.min(missing.len());
        for &i in missing.iter().take(src_to_send) {
            plan.push(FecOutPkt {
                info: FecInfo {
                    pkt_type: FecPktType::Source,
                    index: i as u8,
                    num_src: k as u8,
                    round,
                    group: group_id,
                },
                payload: group.sources[i].clone(),
                enc_len: None,
                rexmit_of: group.src_seq[i],
            });
        }

        let matrix = self.matrices.entry(k).or_insert_with(|| CodingMatrix::new(k));
        for _ in src_to_send..dof {
            let idx = group.next_coded_idx as usize;
            if idx >= MAX_DOF_INDEX {
                break;
            }
            group.next_coded_idx += 1;
            let coded = encode_coded(matrix, &group.sources, idx);
            plan.push(FecOutPkt {
                info: FecInfo {
                    pkt_type: FecPktType::Encoded,
                    index: idx as u8,
                    num_src: k as u8,
                    round,
                    group: group_id,
                },
                payload: Bytes::from(coded.data),
                enc_len: Some(coded.enc_len),
                rexmit_of: None,
            });
        }
        trace!(group = group_id, round, dof, "planned fec round");
        plan
    }

    /// Register the sequence number a planned packet went out under.
    pub fn on_transmitted(&mut self, group_id: u16, index: u8, seq: PktSeq) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            if (index as usize) < group.k {
                group.src_seq[index as usize] = Some(seq);
            }
            group.seq_state.entry(seq.0).or_insert((index, false));
            group.unresolved.insert(seq.0);
        }
    }

    /// An ACK covered one of this stream's FEC packets.
    pub fn on_ack(&mut self, info: &FecInfo, seq: PktSeq) -> FecFeedback {
        self.resolve(info.group, seq, true)
    }

    /// One of this stream's FEC packets was declared lost or abandoned.
    pub fn on_lost(&mut self, info: &FecInfo, seq: PktSeq) -> FecFeedback {
        self.resolve(info.group, seq, false)
    }

    fn resolve(&mut self, group_id: u16, seq: PktSeq, acked: bool) -> FecFeedback {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return FecFeedback::None;
        };
        if group.retired {
            return FecFeedback::None;
        }
        group.unresolved.remove(&seq.0);
        if acked {
            if let Some(state) = group.seq_state.get_mut(&seq.0) {
                if !state.1 {
                    state.1 = true;
                    let idx = state.0 as usize;
                    if idx < group.k {
                        group.src_acked[idx] = true;
                    } else {
                        group.coded_acked += 1;
                    }
                }
            }
        }

        if group.all_sources_acked() {
            group.retired = true;
            let unacked = group.unacked_seqs();
            let id = group_id;
            self.groups.remove(&group_id);
            return FecFeedback::Retired { group: id, unacked };
        }
        if group.unresolved.is_empty() {
            if group.round >= group.rounds_total {
                group.retired = true;
                let unacked = group.unacked_seqs();
                self.groups.remove(&group_id);
                return FecFeedback::Retired {
                    group: group_id,
                    unacked,
                };
            }
            return FecFeedback::RoundComplete(group_id);
        }
        FecFeedback::None
    }

    /// A move-forward advanced past this group's range; drop it.
    pub fn on_move_forward(&mut self, past: PktSeq) {
        self.groups.retain(|_, g| {
            let all_past = g
                .seq_state
                .keys()
                .all(|&raw| PktSeq(raw) < past);
            !(all_past && !g.seq_state.is_empty())
        });
    }

    pub fn groups_in_flight(&self) -> usize {
        self.groups.len()
    }

    pub fn pending_sources(&self) -> usize {
        self.pending.len()
    }
}

// ─── Receiver Side ──────────────────────────────────────────────────────────

/// Cap on receive-side group state retained concurrently.
const MAX_RECV_GROUPS: usize = 64;

struct RecvGroup {
    k: usize,
    decoder: GroupDecoder,
    base_seq: Option<PktSeq>,
    solved: bool,
}

/// Receive-side engine: counts arrivals per group and reconstructs missing
/// sources once enough degrees of freedom are in.
pub struct FecReceiver {
    matrices: HashMap<usize, CodingMatrix>,
    groups: BTreeMap<u16, RecvGroup>,
}

impl FecReceiver {
    pub fn new() -> Self {
        FecReceiver {
            matrices: HashMap::new(),
            groups: BTreeMap::new(),
        }
    }

    /// Feed one FEC-tagged data packet. Returns recovered source packets as
    /// (sequence, payload) pairs to hand to reassembly.
    pub fn on_data(
        &mut self,
        info: &FecInfo,
        seq: PktSeq,
        enc_len: Option<u16>,
        payload: Bytes,
    ) -> Vec<(PktSeq, Bytes)> {
        let k = (info.num_src as usize).clamp(1, tables::MAX_SRC_PKTS);
        let group = self.groups.entry(info.group).or_insert_with(|| RecvGroup {
            k,
            decoder: GroupDecoder::new(k),
            base_seq: None,
            solved: false,
        });

        match info.pkt_type {
            FecPktType::Source => {
                // A source's group index pins the group's base sequence.
                group.base_seq = Some(PktSeq(seq.0.wrapping_sub(info.index as u32)));
                group.decoder.add_source(info.index as usize, payload);
            }
            FecPktType::Encoded => {
                if info.round == 1 {
                    // Round-one packets are sequenced contiguously.
                    group.base_seq =
                        Some(PktSeq(seq.0.wrapping_sub(info.index as u32)));
                }
                group.decoder.add_coded(
                    info.index as usize,
                    crate::vdm::CodedPayload {
                        enc_len: enc_len.unwrap_or(0),
                        data: payload.to_vec(),
                    },
                );
            }
        }

        let mut recovered_out = Vec::new();
        if !group.solved && group.decoder.decodable() {
            if let Some(base) = group.base_seq {
                let matrix = self
                    .matrices
                    .entry(group.k)
                    .or_insert_with(|| CodingMatrix::new(group.k));
                if let Some(recovered) = group.decoder.recover(matrix) {
                    group.solved = true;
                    for (idx, payload) in recovered {
                        recovered_out.push((base.add(idx as u32), payload));
                    }
                    if !recovered_out.is_empty() {
                        debug!(
                            group = info.group,
                            recovered = recovered_out.len(),
                            "fec recovery"
                        );
                    }
                }
            }
        }

        // Bound retained group state.
        while self.groups.len() > MAX_RECV_GROUPS {
            let Some(oldest) = self.groups.keys().next().copied() else {
                break;
            };
            self.groups.remove(&oldest);
        }
        recovered_out
    }

    pub fn groups_tracked(&self) -> usize {
        self.groups.len()
    }
}

impl Default for FecReceiver {
    fn default() -> Self {
        Self::new()
    }
}
