//! # Receive Reassembly
//!
//! Per-stream receive state: next-expected tracking with contiguous-run
//! coalescing, duplicate suppression, the move-forward barrier, the
//! observed-arrival log feeding ACK timestamps, and ACK-block synthesis.
//!
//! Ordered streams hold out-of-order payloads until the gap before them
//! fills (or a move-forward abandons it); unordered streams hand payloads
//! up on arrival and keep only bookkeeping for ACK generation.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use tracing::trace;

use crate::seq::{PktSeq, PktTimestamp};
use crate::wire::{AckBlock, AckBlockKind, AckHdr, DeliveryMode, ObservedTime, MAX_ACK_BLOCKS,
                  MAX_OBSERVED_TIMES};

/// How urgently the pending ACK should go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AckUrgency {
    /// Nothing to acknowledge.
    None,
    /// Coalesce behind the delayed-ACK timer.
    Delayed,
    /// The next-expected sequence advanced past a gap; tell the sender now.
    Immediate,
}

#[derive(Debug)]
struct RecvSlot {
    /// Payload buffered for in-order delivery; `None` when already
    /// delivered (unordered arrivals) or not application data.
    payload: Option<Bytes>,
}

#[derive(Debug, Clone, Copy)]
struct Arrival {
    seq: PktSeq,
    rexmit: u8,
    at: PktTimestamp,
}

/// Receive reassembly for one stream.
pub struct Reassembly {
    init_seq: PktSeq,
    delivery: DeliveryMode,
    /// Offset of the smallest sequence not yet received.
    next_expected: u64,
    /// Received sequences above `next_expected`, by offset.
    ooo: BTreeMap<u64, RecvSlot>,
    /// Sequences below this offset are abandoned; never wait for them.
    barrier: u64,
    /// Recent arrivals awaiting an ACK's observed-time records.
    arrivals: VecDeque<Arrival>,
    /// Payloads ready for the application.
    ready: VecDeque<(PktSeq, Bytes)>,
    ack_urgency: AckUrgency,
    /// Offset of a received FIN, if any.
    fin_at: Option<u64>,
    dup_count: u64,
}

impl Reassembly {
    pub fn new(init_seq: PktSeq, delivery: DeliveryMode) -> Self {
        Reassembly {
            init_seq,
            delivery,
            next_expected: 0,
            ooo: BTreeMap::new(),
            barrier: 0,
            arrivals: VecDeque::new(),
            ready: VecDeque::new(),
            ack_urgency: AckUrgency::None,
            fin_at: None,
            dup_count: 0,
        }
    }

    fn offset(&self, seq: PktSeq) -> u64 {
        seq.0.wrapping_sub(self.init_seq.0) as u64
    }

    fn seq_at(&self, offset: u64) -> PktSeq {
        self.init_seq.add(offset as u32)
    }

    /// Smallest sequence not yet received. Monotonically non-decreasing.
    pub fn next_expected(&self) -> PktSeq {
        self.seq_at(self.next_expected)
    }

    pub fn ack_urgency(&self) -> AckUrgency {
        self.ack_urgency
    }

    /// Sequence of the received FIN, once it arrives.
    pub fn fin_seq(&self) -> Option<PktSeq> {
        self.fin_at.map(|o| self.seq_at(o))
    }

    /// All data up to and including the FIN has been received.
    pub fn fin_complete(&self) -> bool {
        self.fin_at.is_some_and(|o| self.next_expected > o)
    }

    pub fn duplicates(&self) -> u64 {
        self.dup_count
    }

    /// Pop the next payload ready for the application.
    pub fn pop_ready(&mut self) -> Option<(PktSeq, Bytes)> {
        self.ready.pop_front()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Accept one application data packet. Returns `true` if it was new.
    pub fn on_data(
        &mut self,
        seq: PktSeq,
        rexmit: u8,
        payload: Bytes,
        fin: bool,
        now: PktTimestamp,
    ) -> bool {
        self.on_packet(seq, rexmit, Some(payload), fin, now)
    }

    /// Accept a packet that occupies sequence space but carries nothing for
    /// the application (an FEC coded packet).
    pub fn on_non_app(&mut self, seq: PktSeq, rexmit: u8, now: PktTimestamp) -> bool {
        self.on_packet(seq, rexmit, None, false, now)
    }

    fn on_packet(
        &mut self,
        seq: PktSeq,
        rexmit: u8,
        payload: Option<Bytes>,
        fin: bool,
        now: PktTimestamp,
    ) -> bool {
        let off = self.offset(seq);
        if off < self.barrier.max(self.next_expected) {
            // Obsolete: already delivered or moved past.
            self.dup_count += 1;
            return false;
        }
        // Log the arrival for the next ACK's observed times.
        self.arrivals.push_back(Arrival { seq, rexmit, at: now });
        while self.arrivals.len() > 2 * MAX_OBSERVED_TIMES {
            self.arrivals.pop_front();
        }

        if self.ooo.contains_key(&off) {
            self.dup_count += 1;
            self.bump_urgency(AckUrgency::Delayed);
            return false;
        }

        if fin {
            self.fin_at = Some(off);
        }

        let buffered = match (payload, self.delivery) {
            (None, _) => None,
            (Some(payload), DeliveryMode::Ordered) => Some(payload),
            (Some(payload), DeliveryMode::Unordered) => {
                // Deliver on arrival; keep the slot for duplicate
                // suppression and ACK synthesis only.
                self.ready.push_back((seq, payload));
                None
            }
        };
        self.ooo.insert(off, RecvSlot { payload: buffered });

        if off == self.next_expected {
            let advanced = self.advance();
            // Consuming more than the arrival itself means a gap closed.
            let urgency = if advanced > 1 {
                AckUrgency::Immediate
            } else {
                AckUrgency::Delayed
            };
            self.bump_urgency(urgency);
        } else {
            trace!(seq = %seq, expected = %self.next_expected(), "out-of-order arrival");
            self.bump_urgency(AckUrgency::Delayed);
        }
        true
    }

    /// Apply a move-forward: abandon everything below `mf_seq`, delivering
    /// whatever arrived inside the abandoned span in order.
    pub fn on_move_forward(&mut self, mf_seq: PktSeq) {
        let mf = self.offset(mf_seq);
        if mf <= self.barrier && mf <= self.next_expected {
            return;
        }
        self.barrier = self.barrier.max(mf);
        while self.next_expected < self.barrier {
            if let Some(slot) = self.ooo.remove(&self.next_expected) {
                if let Some(payload) = slot.payload {
                    self.ready.push_back((self.seq_at(self.next_expected), payload));
                }
            }
            self.next_expected += 1;
        }
        // A run just above the barrier may now be contiguous.
        self.advance();
        self.bump_urgency(AckUrgency::Immediate);
    }

    /// Consume the contiguous run at `next_expected`. Returns how many
    /// slots were consumed.
    fn advance(&mut self) -> u64 {
        let mut consumed = 0;
        while let Some(slot) = self.ooo.remove(&self.next_expected) {
            if let Some(payload) = slot.payload {
                self.ready.push_back((self.seq_at(self.next_expected), payload));
            }
            self.next_expected += 1;
            consumed += 1;
        }
        consumed
    }

    fn bump_urgency(&mut self, urgency: AckUrgency) {
        self.ack_urgency = self.ack_urgency.max(urgency);
    }

    /// Synthesize the pending acknowledgment and clear the pending-ACK
    /// flag. One header holds at most 31 block offsets; a large
    /// out-of-order set spills into additional chainable ACK headers so
    /// every received sequence is advertised. Observed-time records ride
    /// on the first header only.
    pub fn build_acks(&mut self, stream_id: u8, now: PktTimestamp, ts_delta: u32) -> Vec<AckHdr> {
        let mut observed = Vec::with_capacity(MAX_OBSERVED_TIMES);
        while observed.len() < MAX_OBSERVED_TIMES {
            let Some(arrival) = self.arrivals.pop_back() else {
                break;
            };
            observed.push(ObservedTime {
                seq: arrival.seq,
                rexmit: arrival.rexmit,
                delta_us: now.micros_since(arrival.at),
            });
        }
        self.arrivals.clear();
        self.ack_urgency = AckUrgency::None;

        let block_sets = self.synthesize_block_sets();
        let ne_seq = self.next_expected();
        if block_sets.is_empty() {
            return vec![AckHdr {
                stream_id,
                ne_seq,
                ts: now,
                ts_delta,
                observed,
                blocks: Vec::new(),
            }];
        }
        block_sets
            .into_iter()
            .enumerate()
            .map(|(i, blocks)| AckHdr {
                stream_id,
                ne_seq,
                ts: now,
                ts_delta,
                observed: if i == 0 {
                    std::mem::take(&mut observed)
                } else {
                    Vec::new()
                },
                blocks,
            })
            .collect()
    }

    /// Single-header form, for callers that only need the leading ACK.
    pub fn build_ack(&mut self, stream_id: u8, now: PktTimestamp, ts_delta: u32) -> AckHdr {
        self.build_acks(stream_id, now, ts_delta)
            .into_iter()
            .next()
            .expect("at least one ack header")
    }

    /// Encode the out-of-order set as ACK blocks: isolated sequences as
    /// single blocks, runs of two or more as a range-endpoint pair.
    /// Chunked so each set respects the per-header count field.
    fn synthesize_block_sets(&self) -> Vec<Vec<AckBlock>> {
        let mut sets: Vec<Vec<AckBlock>> = Vec::new();
        let mut blocks: Vec<AckBlock> = Vec::new();
        let mut iter = self.ooo.keys().peekable();
        while let Some(&start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&&(end + 1)) {
                iter.next();
                end += 1;
            }
            let start_rel = start - self.next_expected;
            let end_rel = end - self.next_expected;
            if end_rel > 0x7FFF {
                break; // beyond the 15-bit offset reach
            }
            let needed = if start == end { 1 } else { 2 };
            if blocks.len() + needed > MAX_ACK_BLOCKS {
                sets.push(std::mem::take(&mut blocks));
            }
            if needed == 1 {
                blocks.push(AckBlock {
                    kind: AckBlockKind::Single,
                    offset: start_rel as u16,
                });
            } else {
                blocks.push(AckBlock {
                    kind: AckBlockKind::RangeEnd,
                    offset: start_rel as u16,
                });
                blocks.push(AckBlock {
                    kind: AckBlockKind::RangeEnd,
                    offset: end_rel as u16,
                });
            }
        }
        if !blocks.is_empty() {
            sets.push(blocks);
        }
        sets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u8) -> Bytes {
        Bytes::from(vec![n; 8])
    }

    fn ordered(init: u32) -> Reassembly {
        Reassembly::new(PktSeq(init), DeliveryMode::Ordered)
    }

    #[test]
    fn in_order_arrivals_deliver_immediately() {
        let mut r = ordered(1000);
        for i in 0..5u32 {
            assert!(r.on_data(PktSeq(1000 + i), 0, payload(i as u8), false, PktTimestamp(0)));
        }
        assert_eq!(r.next_expected(), PktSeq(1005));
        let seqs: Vec<u32> = std::iter::from_fn(|| r.pop_ready()).map(|(s, _)| s.0).collect();
        assert_eq!(seqs, vec![1000, 1001, 1002, 1003, 1004]);
    }

    #[test]
    fn gap_holds_ordered_delivery() {
        let mut r = ordered(0);
        r.on_data(PktSeq(0), 0, payload(0), false, PktTimestamp(0));
        // 1 missing
        r.on_data(PktSeq(2), 0, payload(2), false, PktTimestamp(0));
        r.on_data(PktSeq(3), 0, payload(3), false, PktTimestamp(0));
        assert_eq!(r.next_expected(), PktSeq(1));
        let _ = r.pop_ready();
        assert!(r.pop_ready().is_none(), "2 and 3 wait behind the gap");

        // Filling the gap releases the run and demands an immediate ACK.
        r.on_data(PktSeq(1), 0, payload(1), false, PktTimestamp(0));
        assert_eq!(r.ack_urgency(), AckUrgency::Immediate);
        assert_eq!(r.next_expected(), PktSeq(4));
        let seqs: Vec<u32> = std::iter::from_fn(|| r.pop_ready()).map(|(s, _)| s.0).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn unordered_delivers_on_arrival() {
        let mut r = Reassembly::new(PktSeq(0), DeliveryMode::Unordered);
        r.on_data(PktSeq(3), 0, payload(3), false, PktTimestamp(0));
        r.on_data(PktSeq(0), 0, payload(0), false, PktTimestamp(0));
        let seqs: Vec<u32> = std::iter::from_fn(|| r.pop_ready()).map(|(s, _)| s.0).collect();
        assert_eq!(seqs, vec![3, 0]);
    }

    #[test]
    fn duplicates_suppressed() {
        let mut r = Reassembly::new(PktSeq(0), DeliveryMode::Unordered);
        assert!(r.on_data(PktSeq(2), 0, payload(2), false, PktTimestamp(0)));
        assert!(!r.on_data(PktSeq(2), 1, payload(2), false, PktTimestamp(0)));
        assert_eq!(r.duplicates(), 1);
        assert_eq!(r.ready_len(), 1, "payload delivered exactly once");

        // Delivered and advanced past: an even later copy is obsolete.
        r.on_data(PktSeq(0), 0, payload(0), false, PktTimestamp(0));
        r.on_data(PktSeq(1), 0, payload(1), false, PktTimestamp(0));
        assert!(!r.on_data(PktSeq(1), 1, payload(1), false, PktTimestamp(0)));
    }

    #[test]
    fn next_expected_is_monotone() {
        let mut r = ordered(0);
        let mut last = r.next_expected();
        for &s in &[0u32, 5, 2, 1, 9, 3, 4, 6, 7, 8, 10] {
            r.on_data(PktSeq(s), 0, payload(s as u8), false, PktTimestamp(0));
            assert!(r.next_expected() >= last);
            last = r.next_expected();
        }
        assert_eq!(r.next_expected(), PktSeq(11));
    }

    #[test]
    fn move_forward_advances_past_abandoned() {
        let mut r = ordered(0);
        r.on_data(PktSeq(0), 0, payload(0), false, PktTimestamp(0));
        // 1 and 2 lost for good; 3 arrived.
        r.on_data(PktSeq(3), 0, payload(3), false, PktTimestamp(0));
        r.on_move_forward(PktSeq(3));
        assert_eq!(r.next_expected(), PktSeq(4), "3 coalesces after the barrier");
        let seqs: Vec<u32> = std::iter::from_fn(|| r.pop_ready()).map(|(s, _)| s.0).collect();
        assert_eq!(seqs, vec![0, 3]);

        // Late copies of abandoned packets are obsolete.
        assert!(!r.on_data(PktSeq(1), 2, payload(1), false, PktTimestamp(0)));
    }

    #[test]
    fn move_forward_never_regresses() {
        let mut r = ordered(0);
        for i in 0..4u32 {
            r.on_data(PktSeq(i), 0, payload(0), false, PktTimestamp(0));
        }
        r.on_move_forward(PktSeq(2));
        assert_eq!(r.next_expected(), PktSeq(4));
    }

    #[test]
    fn ack_blocks_single_and_range() {
        let mut r = ordered(100);
        r.on_data(PktSeq(102), 0, payload(2), false, PktTimestamp(0));
        r.on_data(PktSeq(105), 0, payload(5), false, PktTimestamp(0));
        r.on_data(PktSeq(106), 0, payload(6), false, PktTimestamp(0));
        r.on_data(PktSeq(107), 0, payload(7), false, PktTimestamp(0));

        let ack = r.build_ack(1, PktTimestamp(1_000), 0);
        assert_eq!(ack.ne_seq, PktSeq(100));
        assert_eq!(
            ack.blocks,
            vec![
                AckBlock {
                    kind: AckBlockKind::Single,
                    offset: 2,
                },
                AckBlock {
                    kind: AckBlockKind::RangeEnd,
                    offset: 5,
                },
                AckBlock {
                    kind: AckBlockKind::RangeEnd,
                    offset: 7,
                },
            ]
        );
    }

    #[test]
    fn ack_observed_times_most_recent_first() {
        let mut r = ordered(0);
        for i in 0..3u32 {
            r.on_data(PktSeq(i), 0, payload(i as u8), false, PktTimestamp(i * 100));
        }
        let ack = r.build_ack(1, PktTimestamp(1_000), 0);
        assert_eq!(ack.observed.len(), 3);
        assert_eq!(ack.observed[0].seq, PktSeq(2));
        assert_eq!(ack.observed[0].delta_us, 800);
        assert_eq!(ack.observed[2].seq, PktSeq(0));
        assert_eq!(ack.observed[2].delta_us, 1_000);
    }

    #[test]
    fn ack_observed_cap_is_seven() {
        let mut r = ordered(0);
        for i in 0..12u32 {
            r.on_data(PktSeq(i), 0, payload(i as u8), false, PktTimestamp(0));
        }
        let ack = r.build_ack(1, PktTimestamp(0), 0);
        assert_eq!(ack.observed.len(), MAX_OBSERVED_TIMES);
        assert_eq!(ack.observed[0].seq, PktSeq(11));
    }

    #[test]
    fn large_out_of_order_set_spills_into_chained_acks() {
        let mut r = ordered(0);
        // 40 isolated sequences (every other one missing) need 40 single
        // blocks: more than one header's worth.
        for i in 0..40u32 {
            r.on_data(PktSeq(2 + 2 * i), 0, payload(1), false, PktTimestamp(0));
        }
        let acks = r.build_acks(1, PktTimestamp(0), 0);
        assert!(acks.len() >= 2);
        let total: usize = acks.iter().map(|a| a.blocks.len()).sum();
        assert_eq!(total, 40);
        for ack in &acks {
            assert!(ack.blocks.len() <= MAX_ACK_BLOCKS);
            assert_eq!(ack.ne_seq, PktSeq(0));
        }
        // Every received sequence is advertised across the set.
        let advertised: Vec<u32> = acks.iter().flat_map(|a| a.block_seqs()).map(|s| s.0).collect();
        assert_eq!(advertised.len(), 40);
        assert!(advertised.contains(&2) && advertised.contains(&80));
    }

    #[test]
    fn build_ack_clears_urgency() {
        let mut r = ordered(0);
        r.on_data(PktSeq(0), 0, payload(0), false, PktTimestamp(0));
        assert_eq!(r.ack_urgency(), AckUrgency::Delayed);
        let _ = r.build_ack(1, PktTimestamp(0), 0);
        assert_eq!(r.ack_urgency(), AckUrgency::None);
    }

    #[test]
    fn fin_tracking() {
        let mut r = ordered(0);
        r.on_data(PktSeq(0), 0, payload(0), false, PktTimestamp(0));
        r.on_data(PktSeq(2), 0, payload(2), true, PktTimestamp(0));
        assert_eq!(r.fin_seq(), Some(PktSeq(2)));
        assert!(!r.fin_complete());
        r.on_data(PktSeq(1), 0, payload(1), false, PktTimestamp(0));
        assert!(r.fin_complete());
    }
}
