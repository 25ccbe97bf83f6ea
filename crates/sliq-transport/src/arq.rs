//! # Sent-Packet Manager
//!
//! Sender-side reliability state for one stream: an ordered map of
//! in-flight packets, ACK consumption, RTT sampling under Karn's rule,
//! duplicate-ACK loss marking, retransmission budgets, and abandonment
//! with move-forward signalling for the semi-reliable modes.
//!
//! ## Loss detection
//!
//! A packet is declared lost when three ACKs arrive that each evidence
//! delivery of a later sequence without covering it, or when its
//! retransmission timer expires. Lost packets are retransmitted while the
//! stream's budget allows and abandoned afterwards; the abandonment point
//! is advertised to the receiver through a move-forward sequence.

use std::collections::BTreeMap;

use tracing::trace;

use crate::pool::FrameHandle;
use crate::rtt::RttEstimator;
use crate::seq::{PktSeq, PktTimestamp};
use crate::wire::{AckHdr, FecInfo};

/// Duplicate-ACK threshold for loss marking.
const DUP_ACK_THRESHOLD: u8 = 3;

/// Retransmission ceiling in reliable mode before the stream escalates to
/// a reset.
const RELIABLE_REXMIT_CEILING: u8 = 15;

// ─── Sent Packet ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentState {
    InFlight,
    Acked,
    Lost,
    Abandoned,
}

/// Per-packet metadata while delivery is unresolved.
#[derive(Debug)]
pub struct SentPacket {
    pub seq: PktSeq,
    pub rexmit: u8,
    pub sent_at: PktTimestamp,
    pub size: u16,
    pub fec: Option<FecInfo>,
    pub persist: bool,
    pub fin: bool,
    /// Pooled payload retained for retransmission.
    pub handle: Option<FrameHandle>,
    pub state: SentState,
    dup_acks: u8,
    rto_at: PktTimestamp,
}

/// A packet whose delivery was resolved by an ACK.
#[derive(Debug)]
pub struct ResolvedPacket {
    pub seq: PktSeq,
    pub fec: Option<FecInfo>,
    pub handle: Option<FrameHandle>,
    pub fin: bool,
}

/// What one ACK (or timer fire) did to the in-flight set.
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub newly_acked: Vec<ResolvedPacket>,
    /// Lost packets with retransmission budget remaining.
    pub to_rexmit: Vec<PktSeq>,
    /// Packets given up on; their range feeds the next move-forward.
    pub abandoned: Vec<ResolvedPacket>,
    /// Reliable-mode retransmission ceiling was hit.
    pub escalate_reset: bool,
}

// ─── Manager ────────────────────────────────────────────────────────────────

/// Sent-packet manager for a single stream.
pub struct SentPktManager {
    init_seq: PktSeq,
    next_seq: PktSeq,
    /// Keyed by offset from `init_seq`; strictly monotonic per first
    /// transmission.
    packets: BTreeMap<u64, SentPacket>,
    /// Offset of the lowest sequence not yet resolved.
    una: u64,
    /// `None` retransmits until acknowledged (reliable mode); `Some(0)`
    /// never retransmits (best effort).
    rexmit_limit: Option<u8>,
    /// Move-forward point not yet advertised to the peer.
    pending_move_fwd: Option<PktSeq>,
    largest_acked: Option<PktSeq>,
}

impl SentPktManager {
    pub fn new(init_seq: PktSeq, rexmit_limit: Option<u8>) -> Self {
        SentPktManager {
            init_seq,
            next_seq: init_seq,
            packets: BTreeMap::new(),
            una: 0,
            rexmit_limit,
            pending_move_fwd: None,
            largest_acked: None,
        }
    }

    fn offset(&self, seq: PktSeq) -> u64 {
        seq.0.wrapping_sub(self.init_seq.0) as u64
    }

    fn seq_at(&self, offset: u64) -> PktSeq {
        self.init_seq.add(offset as u32)
    }

    /// Allocate the next first-transmission sequence number.
    pub fn alloc_seq(&mut self) -> PktSeq {
        self.next_seq.get_inc()
    }

    /// Sequence that will be assigned next.
    pub fn next_seq(&self) -> PktSeq {
        self.next_seq
    }

    /// Lowest unresolved sequence.
    pub fn snd_una(&self) -> PktSeq {
        self.seq_at(self.una)
    }

    pub fn in_flight(&self) -> usize {
        self.packets
            .values()
            .filter(|p| matches!(p.state, SentState::InFlight | SentState::Lost))
            .count()
    }

    pub fn has_unresolved(&self) -> bool {
        self.packets
            .values()
            .any(|p| matches!(p.state, SentState::InFlight | SentState::Lost))
    }

    pub fn get(&self, seq: PktSeq) -> Option<&SentPacket> {
        self.packets.get(&self.offset(seq))
    }

    /// Record a transmission (first or repeat). At most one in-flight entry
    /// exists per sequence; a retransmission updates it in place.
    #[allow(clippy::too_many_arguments)]
    pub fn on_transmit(
        &mut self,
        seq: PktSeq,
        size: u16,
        fec: Option<FecInfo>,
        persist: bool,
        fin: bool,
        handle: Option<FrameHandle>,
        now: PktTimestamp,
        rto_us: u64,
    ) -> u8 {
        let off = self.offset(seq);
        match self.packets.get_mut(&off) {
            Some(pkt) => {
                pkt.rexmit = pkt.rexmit.saturating_add(1);
                pkt.sent_at = now;
                pkt.state = SentState::InFlight;
                pkt.dup_acks = 0;
                pkt.rto_at = Self::backoff(now, rto_us, pkt.rexmit);
                pkt.rexmit
            }
            None => {
                self.packets.insert(
                    off,
                    SentPacket {
                        seq,
                        rexmit: 0,
                        sent_at: now,
                        size,
                        fec,
                        persist,
                        fin,
                        handle,
                        state: SentState::InFlight,
                        dup_acks: 0,
                        rto_at: Self::backoff(now, rto_us, 0),
                    },
                );
                0
            }
        }
    }

    fn backoff(now: PktTimestamp, rto_us: u64, rexmit: u8) -> PktTimestamp {
        let scaled = rto_us.saturating_mul(1u64 << rexmit.min(6));
        now.add_micros(scaled.min(u32::MAX as u64 / 2) as u32)
    }

    /// Consume one ACK header: implicit acks below NES, block acks above it,
    /// Karn-filtered RTT samples from the observed times, and duplicate-ACK
    /// loss marking.
    pub fn on_ack(&mut self, ack: &AckHdr, now: PktTimestamp, rtt: &mut RttEstimator) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        // RTT samples first, while transmit timestamps are still present.
        // A sample is valid only when the receiver observed the same
        // transmission attempt we have on record.
        for obs in &ack.observed {
            if let Some(pkt) = self.packets.get(&self.offset(obs.seq)) {
                if pkt.rexmit == obs.rexmit && pkt.state != SentState::Acked {
                    let elapsed = now.micros_since(pkt.sent_at) as f64;
                    let sample = elapsed - obs.delta_us as f64;
                    if sample >= 0.0 {
                        rtt.on_sample(sample);
                    }
                }
            }
        }

        // Implicit acks: everything below the next-expected sequence.
        // Anything beyond what was ever sent is a bogus ACK; clamp it out.
        let next_off = self.offset(self.next_seq);
        let nes_off = self.offset(ack.ne_seq).min(next_off);
        let implicit: Vec<u64> = self
            .packets
            .range(..nes_off)
            .filter(|(_, p)| !matches!(p.state, SentState::Acked | SentState::Abandoned))
            .map(|(&o, _)| o)
            .collect();
        for off in implicit {
            self.mark_acked(off, &mut outcome);
        }

        // Block acks: received out of order, NES unchanged.
        let mut evidence = nes_off;
        for seq in ack.block_seqs() {
            let off = self.offset(seq);
            if off >= next_off {
                continue;
            }
            evidence = evidence.max(off + 1);
            if let Some(pkt) = self.packets.get(&off) {
                if !matches!(pkt.state, SentState::Acked | SentState::Abandoned) {
                    self.mark_acked(off, &mut outcome);
                }
            }
        }

        // Duplicate-ACK accounting: every unacked packet below the highest
        // evidenced delivery takes a strike.
        let struck: Vec<u64> = self
            .packets
            .range(..evidence)
            .filter(|(_, p)| p.state == SentState::InFlight)
            .map(|(&o, _)| o)
            .collect();
        for off in struck {
            let lost = match self.packets.get_mut(&off) {
                Some(pkt) => {
                    pkt.dup_acks = pkt.dup_acks.saturating_add(1);
                    if pkt.dup_acks >= DUP_ACK_THRESHOLD {
                        pkt.state = SentState::Lost;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if lost {
                self.dispose_lost(off, &mut outcome);
            }
        }

        self.advance_una();
        outcome
    }

    /// Fire expired retransmission timers.
    pub fn on_timer(&mut self, now: PktTimestamp) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        let expired: Vec<u64> = self
            .packets
            .iter()
            .filter(|(_, p)| p.state == SentState::InFlight && !p.rto_at.is_after(now))
            .map(|(&o, _)| o)
            .collect();
        for off in expired {
            if let Some(pkt) = self.packets.get_mut(&off) {
                pkt.state = SentState::Lost;
            }
            self.dispose_lost(off, &mut outcome);
        }
        self.advance_una();
        outcome
    }

    /// Earliest pending retransmission deadline.
    pub fn next_timeout(&self) -> Option<PktTimestamp> {
        self.packets
            .values()
            .filter(|p| p.state == SentState::InFlight)
            .map(|p| p.rto_at)
            .min_by(|a, b| (a.0.wrapping_sub(b.0) as i32).cmp(&0))
    }

    /// The move-forward point to advertise, if abandonment created one.
    pub fn take_move_forward(&mut self) -> Option<PktSeq> {
        self.pending_move_fwd.take()
    }

    /// Whether a move-forward is waiting to be advertised.
    pub fn move_forward_pending(&self) -> bool {
        self.pending_move_fwd.is_some()
    }

    /// Abandon one packet outright (FEC group retirement). Returns its
    /// pooled payload for release.
    pub fn abandon(&mut self, seq: PktSeq) -> Option<FrameHandle> {
        let off = self.offset(seq);
        let handle = match self.packets.get_mut(&off) {
            Some(pkt) if pkt.state != SentState::Acked => {
                pkt.state = SentState::Abandoned;
                pkt.handle.take()
            }
            _ => None,
        };
        self.advance_una();
        handle
    }

    pub fn largest_acked(&self) -> Option<PktSeq> {
        self.largest_acked
    }

    fn mark_acked(&mut self, off: u64, outcome: &mut AckOutcome) {
        if let Some(pkt) = self.packets.get_mut(&off) {
            pkt.state = SentState::Acked;
            let resolved = ResolvedPacket {
                seq: pkt.seq,
                fec: pkt.fec,
                handle: pkt.handle.take(),
                fin: pkt.fin,
            };
            match self.largest_acked {
                Some(cur) if cur >= resolved.seq => {}
                _ => self.largest_acked = Some(resolved.seq),
            }
            outcome.newly_acked.push(resolved);
        }
    }

    /// Route a freshly lost packet: back onto the wire while budget lasts,
    /// abandoned otherwise.
    fn dispose_lost(&mut self, off: u64, outcome: &mut AckOutcome) {
        let pkt = match self.packets.get_mut(&off) {
            Some(p) => p,
            None => return,
        };
        match self.rexmit_limit {
            Some(limit) if pkt.rexmit >= limit => {
                pkt.state = SentState::Abandoned;
                trace!(seq = %pkt.seq, rexmit = pkt.rexmit, "abandoning packet");
                outcome.abandoned.push(ResolvedPacket {
                    seq: pkt.seq,
                    fec: pkt.fec,
                    handle: pkt.handle.take(),
                    fin: pkt.fin,
                });
            }
            None if pkt.rexmit >= RELIABLE_REXMIT_CEILING => {
                outcome.escalate_reset = true;
            }
            _ => outcome.to_rexmit.push(pkt.seq),
        }
    }

    /// Drop the resolved prefix and surface a move-forward when abandonment
    /// is part of it.
    fn advance_una(&mut self) {
        let mut abandoned_prefix = false;
        while let Some((&off, pkt)) = self.packets.iter().next() {
            if off != self.una {
                break;
            }
            match pkt.state {
                SentState::Acked => {}
                SentState::Abandoned => abandoned_prefix = true,
                _ => break,
            }
            self.packets.remove(&off);
            self.una += 1;
        }
        if abandoned_prefix {
            self.pending_move_fwd = Some(self.seq_at(self.una));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{AckBlock, AckBlockKind, ObservedTime};

    fn ack(ne_seq: u32, blocks: Vec<AckBlock>, observed: Vec<ObservedTime>) -> AckHdr {
        AckHdr {
            stream_id: 1,
            ne_seq: PktSeq(ne_seq),
            ts: PktTimestamp(0),
            ts_delta: 0,
            observed,
            blocks,
        }
    }

    fn send_n(mgr: &mut SentPktManager, n: u32, now: PktTimestamp) {
        for _ in 0..n {
            let seq = mgr.alloc_seq();
            mgr.on_transmit(seq, 1200, None, false, false, None, now, 200_000);
        }
    }

    #[test]
    fn implicit_ack_below_nes() {
        let mut mgr = SentPktManager::new(PktSeq(100), None);
        let mut rtt = RttEstimator::new();
        send_n(&mut mgr, 5, PktTimestamp(0));

        let out = mgr.on_ack(&ack(103, vec![], vec![]), PktTimestamp(1_000), &mut rtt);
        assert_eq!(out.newly_acked.len(), 3);
        assert_eq!(mgr.snd_una(), PktSeq(103));
        assert_eq!(mgr.in_flight(), 2);
    }

    #[test]
    fn block_ack_does_not_advance_una() {
        let mut mgr = SentPktManager::new(PktSeq(0), None);
        let mut rtt = RttEstimator::new();
        send_n(&mut mgr, 4, PktTimestamp(0));

        // Receiver has 0 and 2: NES=1, block at offset 1.
        let out = mgr.on_ack(
            &ack(
                1,
                vec![AckBlock {
                    kind: AckBlockKind::Single,
                    offset: 1,
                }],
                vec![],
            ),
            PktTimestamp(1_000),
            &mut rtt,
        );
        let acked: Vec<u32> = out.newly_acked.iter().map(|p| p.seq.0).collect();
        assert_eq!(acked, vec![0, 2]);
        assert_eq!(mgr.snd_una(), PktSeq(1));
    }

    #[test]
    fn triple_dup_ack_marks_lost() {
        let mut mgr = SentPktManager::new(PktSeq(0), None);
        let mut rtt = RttEstimator::new();
        send_n(&mut mgr, 3, PktTimestamp(0));

        // Three ACKs evidencing seq 1 and 2 while 0 stays missing.
        for i in 0..2 {
            let out = mgr.on_ack(
                &ack(
                    0,
                    vec![AckBlock {
                        kind: AckBlockKind::Single,
                        offset: 1 + i,
                    }],
                    vec![],
                ),
                PktTimestamp(1_000),
                &mut rtt,
            );
            assert!(out.to_rexmit.is_empty(), "strike {i} should not mark yet");
        }
        let out = mgr.on_ack(
            &ack(
                0,
                vec![AckBlock {
                    kind: AckBlockKind::Single,
                    offset: 2,
                }],
                vec![],
            ),
            PktTimestamp(2_000),
            &mut rtt,
        );
        assert_eq!(out.to_rexmit, vec![PktSeq(0)]);
    }

    #[test]
    fn rexmit_budget_exhaustion_abandons_and_move_forward() {
        let mut mgr = SentPktManager::new(PktSeq(10), Some(1));
        let mut rtt = RttEstimator::new();
        let seq = mgr.alloc_seq();
        mgr.on_transmit(seq, 100, None, false, false, None, PktTimestamp(0), 1_000);

        // First timer fire: one retransmission allowed.
        let out = mgr.on_timer(PktTimestamp(2_000));
        assert_eq!(out.to_rexmit, vec![PktSeq(10)]);
        mgr.on_transmit(seq, 100, None, false, false, None, PktTimestamp(2_000), 1_000);

        // Second fire: budget (limit 1) exhausted.
        let out = mgr.on_timer(PktTimestamp(10_000));
        assert!(out.to_rexmit.is_empty());
        assert_eq!(out.abandoned.len(), 1);
        assert_eq!(mgr.take_move_forward(), Some(PktSeq(11)));
        assert!(!mgr.has_unresolved());
    }

    #[test]
    fn best_effort_never_retransmits() {
        let mut mgr = SentPktManager::new(PktSeq(0), Some(0));
        let mut rtt = RttEstimator::new();
        send_n(&mut mgr, 1, PktTimestamp(0));

        let out = mgr.on_timer(PktTimestamp(10_000_000));
        assert!(out.to_rexmit.is_empty());
        assert_eq!(out.abandoned.len(), 1);
    }

    #[test]
    fn karn_filter_accepts_matching_rexmit_only() {
        let mut mgr = SentPktManager::new(PktSeq(0), None);
        let mut rtt = RttEstimator::new();
        let seq = mgr.alloc_seq();
        mgr.on_transmit(seq, 100, None, false, false, None, PktTimestamp(0), 200_000);
        mgr.on_transmit(seq, 100, None, false, false, None, PktTimestamp(30_000), 200_000);

        // Observation of the original transmission: stale, must be ignored.
        mgr.on_ack(
            &ack(
                0,
                vec![],
                vec![ObservedTime {
                    seq: PktSeq(0),
                    rexmit: 0,
                    delta_us: 100,
                }],
            ),
            PktTimestamp(50_000),
            &mut rtt,
        );
        assert_eq!(rtt.samples(), 0);

        // Observation of the retransmission: valid sample of 50000-30000-5000.
        mgr.on_ack(
            &ack(
                1,
                vec![],
                vec![ObservedTime {
                    seq: PktSeq(0),
                    rexmit: 1,
                    delta_us: 5_000,
                }],
            ),
            PktTimestamp(50_000),
            &mut rtt,
        );
        assert_eq!(rtt.samples(), 1);
        assert_eq!(rtt.srtt_us(), 15_000.0);
    }

    #[test]
    fn reliable_mode_escalates_at_ceiling() {
        let mut mgr = SentPktManager::new(PktSeq(0), None);
        let seq = mgr.alloc_seq();
        let mut now = 0u32;
        mgr.on_transmit(seq, 100, None, false, false, None, PktTimestamp(now), 1_000);
        let mut escalated = false;
        for _ in 0..20 {
            now += 500_000_000u32 / 4;
            let out = mgr.on_timer(PktTimestamp(now));
            if out.escalate_reset {
                escalated = true;
                break;
            }
            if out.to_rexmit.contains(&seq) {
                mgr.on_transmit(seq, 100, None, false, false, None, PktTimestamp(now), 1_000);
            }
        }
        assert!(escalated, "reliable mode must escalate after the ceiling");
    }

    #[test]
    fn at_most_one_entry_per_sequence() {
        let mut mgr = SentPktManager::new(PktSeq(0), None);
        let seq = mgr.alloc_seq();
        mgr.on_transmit(seq, 10, None, false, false, None, PktTimestamp(0), 1_000);
        let rexmit = mgr.on_transmit(seq, 10, None, false, false, None, PktTimestamp(5), 1_000);
        assert_eq!(rexmit, 1);
        assert_eq!(mgr.in_flight(), 1);
    }

    #[test]
    fn next_timeout_tracks_earliest_inflight() {
        let mut mgr = SentPktManager::new(PktSeq(0), None);
        send_n(&mut mgr, 1, PktTimestamp(0));
        let first = mgr.next_timeout().unwrap();
        send_n(&mut mgr, 1, PktTimestamp(400_000));
        assert_eq!(mgr.next_timeout().unwrap(), first);
    }
}
