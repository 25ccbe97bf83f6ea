//! # Stream
//!
//! One logical packet sequence within a connection. Composes the
//! sent-packet manager, receive reassembly, and (for the ARQ+FEC mode) the
//! FEC engine; enforces the reliability mode and the flow-control window.
//!
//! State machine: `Created → Open → HalfClosed{Local|Remote} → Closed`,
//! with `Reset` reachable from any non-closed state.
//!
//! The stream is pure logic: the connection feeds it inbound headers and
//! pulls outbound packets, timestamps supplied by the caller.

use std::collections::VecDeque;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::arq::{AckOutcome, SentPktManager};
use crate::fec::{FecFeedback, FecReceiver, FecSender, FecSenderConfig, FecTarget};
use crate::pool::{FrameHandle, PacketPool, MAX_FRAME_PAYLOAD};
use crate::reassembly::{AckUrgency, Reassembly};
use crate::rtt::RttEstimator;
use crate::seq::{PktSeq, PktTimestamp};
use crate::wire::{
    AckHdr, DataHdr, DeliveryMode, FecPktType, ReliabilityMode, StreamCreateHdr, StreamErrorCode,
    StreamResetHdr, TimeToGo,
};

/// Ceiling on the receive-side delayed-ACK timer.
const MAX_ACK_DELAY_US: u32 = 25_000;

/// In-engine retransmission allowance for FEC streams: rounds, not the ARQ
/// budget, decide when to give up.
const FEC_REXMIT_ALLOWANCE: u8 = u8::MAX;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The advertised window (or the packet pool) is exhausted and
    /// auto-tuning is off.
    #[error("flow-control window exhausted")]
    FlowControlBlocked,
    /// FIN already sent, or the stream is reset/closed.
    #[error("stream closed to sending")]
    StreamClosed,
    /// Payload exceeds what one packet can carry.
    #[error("payload too large for a single packet")]
    PayloadTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// Nothing deliverable right now.
    #[error("no payload ready")]
    StreamEmpty,
    /// Peer finished or the stream was reset; nothing more will arrive.
    #[error("stream closed to receiving")]
    StreamClosed,
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// Stream parameters. The wire-visible subset travels in Stream-Create;
/// the rest is sender-local policy.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub stream_id: u8,
    /// 0 is highest, 7 lowest.
    pub priority: u8,
    pub delivery: DeliveryMode,
    pub reliability: ReliabilityMode,
    pub init_seq: PktSeq,
    /// Flow-control window in packets.
    pub window: u32,
    pub auto_tune: bool,
    /// Retransmission budget for the semi-reliable ARQ mode.
    pub rexmit_limit: u8,
    /// FEC delivery target (ARQ+FEC mode).
    pub fec_target: FecTarget,
    /// Target packet receive probability.
    pub tgt_precv: f64,
    /// Source packets per FEC group.
    pub fec_group_size: usize,
    /// Loss-rate assumption before the peer's receive counts seed the
    /// estimator.
    pub initial_loss_rate: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            stream_id: 1,
            priority: 3,
            delivery: DeliveryMode::Ordered,
            reliability: ReliabilityMode::ReliableArq,
            init_seq: PktSeq(1),
            window: 256,
            auto_tune: false,
            rexmit_limit: 2,
            fec_target: FecTarget::Rounds(1),
            tgt_precv: 0.99,
            fec_group_size: 10,
            initial_loss_rate: 0.10,
        }
    }
}

impl StreamConfig {
    /// Wire form of this configuration.
    pub fn to_create_hdr(&self, ack: bool) -> StreamCreateHdr {
        let (del_time, tgt_delivery) = match self.fec_target {
            FecTarget::Rounds(n) => (false, n as u16),
            FecTarget::DeliveryTimeMs(ms) => (true, ms),
        };
        StreamCreateHdr {
            ack,
            auto_tune: self.auto_tune,
            del_time,
            stream_id: self.stream_id,
            priority: self.priority,
            init_win_size: self.window,
            init_seq: self.init_seq,
            delivery: self.delivery,
            reliability: self.reliability,
            rexmit_limit: self.rexmit_limit,
            tgt_delivery,
            tgt_rcv_prob: (self.tgt_precv * 10_000.0).round() as u16,
        }
    }

    /// Reconstruct a configuration from a peer's Stream-Create.
    pub fn from_create_hdr(hdr: &StreamCreateHdr) -> Self {
        let fec_target = if hdr.del_time {
            FecTarget::DeliveryTimeMs(hdr.tgt_delivery)
        } else {
            FecTarget::Rounds(hdr.tgt_delivery.max(1).min(255) as u8)
        };
        StreamConfig {
            stream_id: hdr.stream_id,
            priority: hdr.priority,
            delivery: hdr.delivery,
            reliability: hdr.reliability,
            init_seq: hdr.init_seq,
            window: hdr.init_win_size,
            auto_tune: hdr.auto_tune,
            rexmit_limit: hdr.rexmit_limit,
            fec_target,
            tgt_precv: hdr.tgt_rcv_prob as f64 / 10_000.0,
            ..Default::default()
        }
    }
}

// ─── State ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Create sent, peer's matching create not yet seen.
    Created,
    Open,
    /// FIN sent; sending is over, receiving continues.
    HalfClosedLocal,
    /// Peer's FIN consumed; receiving is over, sending continues.
    HalfClosedRemote,
    Closed,
    Reset,
}

struct QueuedPkt {
    /// Pooled payload; `None` for empty control packets (FIN, persist) and
    /// retransmissions, which read the sent-packet manager's copy.
    handle: Option<FrameHandle>,
    fec: Option<crate::wire::FecInfo>,
    enc_len: Option<u16>,
    rexmit_of: Option<PktSeq>,
    fin: bool,
    persist: bool,
}

// ─── Stream ─────────────────────────────────────────────────────────────────

pub struct Stream {
    config: StreamConfig,
    state: StreamState,
    sent: SentPktManager,
    rtt: RttEstimator,
    reasm: Reassembly,
    fec_tx: Option<FecSender>,
    fec_rx: Option<FecReceiver>,
    queue: VecDeque<QueuedPkt>,
    rexmit_queue: VecDeque<PktSeq>,
    loss_rate: f64,
    window: u32,
    fin_queued: bool,
    ack_deadline: Option<PktTimestamp>,
    ack_delay_us: u32,
    persist_due: Option<PktTimestamp>,
    /// Active abandonment barrier. Re-advertised on every outbound data
    /// packet until the peer's next-expected sequence passes it, so a lost
    /// carrier cannot strand the receiver.
    move_fwd_point: Option<PktSeq>,
    /// The current barrier has not been on the wire yet.
    move_fwd_unsent: bool,
    /// Retransmissions performed, for diagnostics.
    rexmit_count: u64,
    /// Source payloads reconstructed by FEC decoding.
    fec_recovered: u64,
}

impl Stream {
    /// Build a stream from its configuration. `peer_init_seq` seeds the
    /// receive side (the peer's initial sequence from its Stream-Create).
    pub fn new(config: StreamConfig, peer_init_seq: PktSeq) -> Self {
        let rexmit_limit = match config.reliability {
            ReliabilityMode::BestEffort => Some(0),
            ReliabilityMode::SemiReliableArq => Some(config.rexmit_limit),
            ReliabilityMode::SemiReliableArqFec => Some(FEC_REXMIT_ALLOWANCE),
            ReliabilityMode::ReliableArq => None,
        };
        let fec = config.reliability == ReliabilityMode::SemiReliableArqFec;
        let ack_delay_us = match config.fec_target {
            FecTarget::DeliveryTimeMs(ms) => ((ms as u32) * 1_000 / 4).min(MAX_ACK_DELAY_US),
            _ => MAX_ACK_DELAY_US,
        };
        Stream {
            sent: SentPktManager::new(config.init_seq, rexmit_limit),
            rtt: RttEstimator::new(),
            reasm: Reassembly::new(peer_init_seq, config.delivery),
            fec_tx: fec.then(|| {
                FecSender::new(FecSenderConfig {
                    group_size: config.fec_group_size,
                    target: config.fec_target,
                    tgt_precv: config.tgt_precv,
                })
            }),
            fec_rx: fec.then(FecReceiver::new),
            queue: VecDeque::new(),
            rexmit_queue: VecDeque::new(),
            loss_rate: config.initial_loss_rate,
            window: config.window,
            fin_queued: false,
            ack_deadline: None,
            ack_delay_us,
            persist_due: None,
            move_fwd_point: None,
            move_fwd_unsent: false,
            rexmit_count: 0,
            fec_recovered: 0,
            state: StreamState::Created,
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn priority(&self) -> u8 {
        self.config.priority
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, StreamState::Closed | StreamState::Reset)
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn retransmissions(&self) -> u64 {
        self.rexmit_count
    }

    /// Payloads reconstructed by FEC decoding on the receive side.
    pub fn fec_recovered(&self) -> u64 {
        self.fec_recovered
    }

    /// Seed the RTT estimator (handshake echo sample).
    pub fn seed_rtt(&mut self, rtt_us: f64) {
        if self.rtt.samples() == 0 && rtt_us > 0.0 {
            self.rtt.on_sample(rtt_us);
        }
    }

    /// Connection-level loss estimate feeding the FEC tables.
    pub fn set_loss_rate(&mut self, per: f64) {
        if per > 0.0 {
            self.loss_rate = per;
        }
    }

    /// Both ends have exchanged Stream-Create.
    pub fn on_create_acked(&mut self) {
        if self.state == StreamState::Created {
            self.state = StreamState::Open;
        }
    }

    // ─── Application Surface ────────────────────────────────────────────

    /// Queue one payload for transmission.
    pub fn send(
        &mut self,
        pool: &mut PacketPool,
        payload: Bytes,
        now: PktTimestamp,
    ) -> Result<(), SendError> {
        if self.fin_queued
            || matches!(
                self.state,
                StreamState::HalfClosedLocal | StreamState::Closed | StreamState::Reset
            )
        {
            return Err(SendError::StreamClosed);
        }
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(SendError::PayloadTooLarge);
        }
        let outstanding = self.sent.in_flight() + self.queue.len();
        if outstanding as u32 >= self.window {
            if self.config.auto_tune {
                self.window = self.window.saturating_mul(2);
                debug!(stream = self.config.stream_id, window = self.window, "window auto-tuned");
            } else {
                if self.persist_due.is_none() {
                    self.persist_due = Some(now.add_micros(self.rtt.rto_us() as u32));
                }
                return Err(SendError::FlowControlBlocked);
            }
        }

        self.persist_due = None;
        match &mut self.fec_tx {
            Some(fec) => {
                let sealed = fec.push_source(payload, self.loss_rate, self.rtt.srtt_us() as u64);
                if let Some(group) = sealed {
                    self.queue_fec_round(pool, group);
                }
            }
            None => {
                let handle = pool.alloc(&payload).ok_or(SendError::FlowControlBlocked)?;
                self.queue.push_back(QueuedPkt {
                    handle: Some(handle),
                    fec: None,
                    enc_len: None,
                    rexmit_of: None,
                    fin: false,
                    persist: false,
                });
            }
        }
        Ok(())
    }

    /// Deliver the next payload.
    pub fn recv(&mut self) -> Result<Bytes, RecvError> {
        if let Some((_, payload)) = self.reasm.pop_ready() {
            return Ok(payload);
        }
        if self.state == StreamState::Reset || self.reasm.fin_complete() {
            Err(RecvError::StreamClosed)
        } else {
            Err(RecvError::StreamEmpty)
        }
    }

    /// Send FIN. Further sends fail.
    pub fn close(&mut self, pool: &mut PacketPool) {
        if self.fin_queued || self.is_terminal() {
            return;
        }
        // Flush a partial FEC group so the tail is protected too.
        let flushed = self
            .fec_tx
            .as_mut()
            .and_then(|fec| fec.flush(self.loss_rate, self.rtt.srtt_us() as u64));
        if let Some(group) = flushed {
            self.queue_fec_round(pool, group);
        }
        self.queue.push_back(QueuedPkt {
            handle: None,
            fec: None,
            enc_len: None,
            rexmit_of: None,
            fin: true,
            persist: false,
        });
        self.fin_queued = true;
        self.state = match self.state {
            StreamState::HalfClosedRemote => StreamState::Closed,
            StreamState::Created | StreamState::Open => StreamState::HalfClosedLocal,
            s => s,
        };
    }

    /// Reset both directions. Returns the header to put on the wire.
    pub fn reset(&mut self, pool: &mut PacketPool, error: StreamErrorCode) -> StreamResetHdr {
        self.drop_outbound(pool);
        self.state = StreamState::Reset;
        StreamResetHdr {
            stream_id: self.config.stream_id,
            error,
            final_seq: self.sent.next_seq(),
        }
    }

    /// Peer reset the stream: abandon everything silently.
    pub fn on_peer_reset(&mut self, pool: &mut PacketPool) {
        self.drop_outbound(pool);
        self.state = StreamState::Reset;
    }

    fn drop_outbound(&mut self, pool: &mut PacketPool) {
        for pkt in self.queue.drain(..) {
            if let Some(h) = pkt.handle {
                pool.release(h);
            }
        }
        self.rexmit_queue.clear();
        let mut seq = self.sent.snd_una();
        while seq < self.sent.next_seq() {
            if let Some(h) = self.sent.abandon(seq) {
                pool.release(h);
            }
            seq = seq.next();
        }
        let _ = self.sent.take_move_forward();
        self.move_fwd_point = None;
        self.move_fwd_unsent = false;
    }

    // ─── Outbound ───────────────────────────────────────────────────────

    /// Whether the stream has anything to put on the wire.
    pub fn has_transmittable(&self, now: PktTimestamp) -> bool {
        if self.state == StreamState::Reset {
            return false;
        }
        !self.rexmit_queue.is_empty()
            || !self.queue.is_empty()
            || self.sent.move_forward_pending()
            || self.move_fwd_unsent
            || self.persist_ready(now)
    }

    /// Fold a manager-raised abandonment point into the advertised barrier.
    fn absorb_move_forward(&mut self) {
        if let Some(mf) = self.sent.take_move_forward() {
            if self.move_fwd_point.map_or(true, |cur| mf > cur) {
                self.move_fwd_point = Some(mf);
                self.move_fwd_unsent = true;
            }
        }
    }

    fn persist_ready(&self, now: PktTimestamp) -> bool {
        self.persist_due.is_some_and(|due| !due.is_after(now))
    }

    /// Produce the next Data header for the wire, stamping it with the
    /// clock and the governing CC id. Returns `None` when idle.
    pub fn next_transmittable(
        &mut self,
        pool: &mut PacketPool,
        now: PktTimestamp,
        cc_id: u8,
    ) -> Option<DataHdr> {
        if self.state == StreamState::Reset {
            return None;
        }
        self.absorb_move_forward();
        let rto = self.rtt.rto_us();

        // Retransmissions first.
        while let Some(seq) = self.rexmit_queue.pop_front() {
            let Some(pkt) = self.sent.get(seq) else { continue };
            let payload = pkt
                .handle
                .and_then(|h| pool.get(h))
                .map(|f| Bytes::copy_from_slice(f.bytes()))
                .unwrap_or_default();
            let fin = pkt.fin;
            let rexmit = self
                .sent
                .on_transmit(seq, payload.len() as u16, None, false, fin, None, now, rto);
            self.rexmit_count += 1;
            let mut hdr = DataHdr::new(self.config.stream_id, seq, now, payload);
            hdr.rexmit = rexmit;
            hdr.fin = fin;
            hdr.cc_id = cc_id;
            hdr.move_fwd = self.stamp_move_forward();
            trace!(stream = self.config.stream_id, seq = %seq, rexmit, "retransmit");
            return Some(hdr);
        }

        // Fresh queue next.
        if let Some(pkt) = self.queue.pop_front() {
            let seq = pkt.rexmit_of.unwrap_or_else(|| self.sent.alloc_seq());
            let payload = match (pkt.rexmit_of, pkt.handle) {
                (Some(_), _) => self
                    .sent
                    .get(seq)
                    .and_then(|p| p.handle)
                    .and_then(|h| pool.get(h))
                    .map(|f| Bytes::copy_from_slice(f.bytes()))
                    .unwrap_or_default(),
                (None, Some(h)) => pool
                    .get(h)
                    .map(|f| Bytes::copy_from_slice(f.bytes()))
                    .unwrap_or_default(),
                (None, None) => Bytes::new(),
            };
            let rexmit = self.sent.on_transmit(
                seq,
                payload.len() as u16,
                pkt.fec,
                pkt.persist,
                pkt.fin,
                pkt.handle.or_else(|| {
                    pkt.rexmit_of
                        .and_then(|_| self.sent.get(seq).and_then(|p| p.handle))
                }),
                now,
                rto,
            );
            if pkt.rexmit_of.is_some() {
                self.rexmit_count += 1;
            }
            if let (Some(fec), Some(tx)) = (pkt.fec, self.fec_tx.as_mut()) {
                tx.on_transmitted(fec.group, fec.index, seq);
            }
            let mut hdr = DataHdr::new(self.config.stream_id, seq, now, payload);
            hdr.rexmit = rexmit;
            hdr.fec = pkt.fec;
            hdr.enc_pkt_len = pkt.enc_len;
            hdr.fin = pkt.fin;
            hdr.persist = pkt.persist;
            hdr.cc_id = cc_id;
            hdr.move_fwd = self.stamp_move_forward();
            // Delivery-time-targeted streams advertise the packet's latency
            // budget.
            if let FecTarget::DeliveryTimeMs(ms) = self.config.fec_target {
                hdr.ttgs = vec![TimeToGo::from_micros(ms as u32 * 1_000)];
            }
            return Some(hdr);
        }

        // A bare move-forward when abandonment outpaced data.
        if self.move_fwd_unsent {
            let seq = self.sent.alloc_seq();
            let rexmit = self
                .sent
                .on_transmit(seq, 0, None, false, false, None, now, rto);
            let mut hdr = DataHdr::new(self.config.stream_id, seq, now, Bytes::new());
            hdr.rexmit = rexmit;
            hdr.cc_id = cc_id;
            hdr.move_fwd = self.stamp_move_forward();
            return Some(hdr);
        }

        // Window persist probe.
        if self.persist_ready(now) {
            self.persist_due = Some(now.add_micros(self.rtt.rto_us() as u32));
            let seq = self.sent.alloc_seq();
            let rexmit = self
                .sent
                .on_transmit(seq, 0, None, true, false, None, now, rto);
            let mut hdr = DataHdr::new(self.config.stream_id, seq, now, Bytes::new());
            hdr.rexmit = rexmit;
            hdr.persist = true;
            hdr.cc_id = cc_id;
            return Some(hdr);
        }

        None
    }

    fn stamp_move_forward(&mut self) -> Option<PktSeq> {
        if self.move_fwd_point.is_some() {
            self.move_fwd_unsent = false;
        }
        self.move_fwd_point
    }

    fn queue_fec_round(&mut self, pool: &mut PacketPool, group: u16) {
        let Some(fec) = self.fec_tx.as_mut() else { return };
        for out in fec.plan_round(group) {
            let handle = if out.rexmit_of.is_none() {
                pool.alloc(&out.payload)
            } else {
                None
            };
            self.queue.push_back(QueuedPkt {
                handle,
                fec: Some(out.info),
                enc_len: out.enc_len,
                rexmit_of: out.rexmit_of,
                fin: false,
                persist: false,
            });
        }
    }

    // ─── Inbound ────────────────────────────────────────────────────────

    /// Apply one inbound Data header. Returns `true` when the packet was
    /// new (feeds the connection's received-packet counter).
    pub fn on_data(&mut self, hdr: &DataHdr, now: PktTimestamp) -> bool {
        if self.state == StreamState::Reset {
            return false;
        }
        if let Some(mf) = hdr.move_fwd {
            self.reasm.on_move_forward(mf);
        }

        let is_new = match hdr.fec {
            Some(info) if info.pkt_type == FecPktType::Encoded => {
                let fresh = self.reasm.on_non_app(hdr.seq, hdr.rexmit, now);
                self.feed_fec(hdr, &info, now);
                fresh
            }
            Some(info) => {
                let fresh =
                    self.reasm
                        .on_data(hdr.seq, hdr.rexmit, hdr.payload.clone(), hdr.fin, now);
                self.feed_fec(hdr, &info, now);
                fresh
            }
            None => self
                .reasm
                .on_data(hdr.seq, hdr.rexmit, hdr.payload.clone(), hdr.fin, now),
        };

        self.update_ack_deadline(now);
        if self.reasm.fin_complete() {
            self.state = match self.state {
                StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
                StreamState::Reset => StreamState::Reset,
                _ => StreamState::HalfClosedRemote,
            };
        }
        is_new
    }

    fn feed_fec(&mut self, hdr: &DataHdr, info: &crate::wire::FecInfo, now: PktTimestamp) {
        let Some(rx) = self.fec_rx.as_mut() else { return };
        let recovered = rx.on_data(info, hdr.seq, hdr.enc_pkt_len, hdr.payload.clone());
        for (seq, payload) in recovered {
            if self.reasm.on_data(seq, 0, payload, false, now) {
                self.fec_recovered += 1;
            }
        }
    }

    /// Apply one inbound ACK. A returned error code means the stream must
    /// be reset (reliable-mode retransmission ceiling).
    pub fn on_ack(
        &mut self,
        pool: &mut PacketPool,
        ack: &AckHdr,
        now: PktTimestamp,
    ) -> Option<StreamErrorCode> {
        let outcome = self.sent.on_ack(ack, now, &mut self.rtt);
        let result = self.apply_outcome(pool, outcome);
        // The peer moved past the barrier: stop advertising it.
        if self.move_fwd_point.is_some_and(|p| ack.ne_seq >= p) {
            self.move_fwd_point = None;
            self.move_fwd_unsent = false;
        }
        result
    }

    /// Fire retransmission timers.
    pub fn on_timer(
        &mut self,
        pool: &mut PacketPool,
        now: PktTimestamp,
    ) -> Option<StreamErrorCode> {
        let outcome = self.sent.on_timer(now);
        self.apply_outcome(pool, outcome)
    }

    fn apply_outcome(
        &mut self,
        pool: &mut PacketPool,
        outcome: AckOutcome,
    ) -> Option<StreamErrorCode> {
        let mut feedback = Vec::new();
        if !outcome.newly_acked.is_empty() {
            // Progress re-opens the window; stop probing.
            self.persist_due = None;
        }
        for acked in outcome.newly_acked {
            if let Some(h) = acked.handle {
                pool.release(h);
            }
            if let (Some(info), Some(tx)) = (acked.fec, self.fec_tx.as_mut()) {
                feedback.push(tx.on_ack(&info, acked.seq));
            }
        }
        for seq in outcome.to_rexmit {
            let fec_info = self.sent.get(seq).and_then(|p| p.fec);
            match (fec_info, self.fec_tx.as_mut()) {
                (Some(info), Some(tx)) => feedback.push(tx.on_lost(&info, seq)),
                _ => self.rexmit_queue.push_back(seq),
            }
        }
        for abandoned in outcome.abandoned {
            if let Some(h) = abandoned.handle {
                pool.release(h);
            }
            if let (Some(info), Some(tx)) = (abandoned.fec, self.fec_tx.as_mut()) {
                feedback.push(tx.on_lost(&info, abandoned.seq));
            }
        }
        for fb in feedback {
            self.apply_fec_feedback(pool, fb);
        }
        self.absorb_move_forward();
        if outcome.escalate_reset {
            return Some(StreamErrorCode::TransmitQueueError);
        }
        None
    }

    fn apply_fec_feedback(&mut self, pool: &mut PacketPool, fb: FecFeedback) {
        match fb {
            FecFeedback::None => {}
            FecFeedback::RoundComplete(group) => self.queue_fec_round(pool, group),
            FecFeedback::Retired { group, unacked } => {
                trace!(stream = self.config.stream_id, group, "fec group retired");
                for seq in unacked {
                    if let Some(h) = self.sent.abandon(seq) {
                        pool.release(h);
                    }
                }
            }
        }
    }

    // ─── ACK Scheduling ─────────────────────────────────────────────────

    fn update_ack_deadline(&mut self, now: PktTimestamp) {
        match self.reasm.ack_urgency() {
            AckUrgency::Immediate => self.ack_deadline = Some(now),
            AckUrgency::Delayed => {
                if self.ack_deadline.is_none() {
                    self.ack_deadline = Some(now.add_micros(self.ack_delay_us));
                }
            }
            AckUrgency::None => {}
        }
    }

    /// Whether the pending ACK should go into the next datagram.
    pub fn ack_due(&self, now: PktTimestamp) -> bool {
        match self.reasm.ack_urgency() {
            AckUrgency::None => false,
            AckUrgency::Immediate => true,
            AckUrgency::Delayed => self.ack_deadline.is_some_and(|d| !d.is_after(now)),
        }
    }

    /// Synthesize the pending acknowledgment; spills into multiple
    /// chainable headers when the out-of-order set is large.
    pub fn build_acks(&mut self, now: PktTimestamp) -> Vec<AckHdr> {
        self.ack_deadline = None;
        self.reasm.build_acks(self.config.stream_id, now, 0)
    }

    /// Earliest deadline this stream needs a timer for.
    pub fn next_timeout(&self) -> Option<PktTimestamp> {
        let mut deadline = self.sent.next_timeout();
        for t in [self.ack_deadline, self.persist_due] {
            deadline = match (deadline, t) {
                (None, t) => t,
                (d, None) => d,
                (Some(a), Some(b)) => Some(if b.is_after(a) { a } else { b }),
            };
        }
        deadline
    }

    /// Receive-side progress marker (diagnostics and tests).
    pub fn next_expected(&self) -> PktSeq {
        self.reasm.next_expected()
    }

    pub fn in_flight(&self) -> usize {
        self.sent.in_flight()
    }

    pub fn snd_una(&self) -> PktSeq {
        self.sent.snd_una()
    }

    pub fn has_unresolved(&self) -> bool {
        self.sent.has_unresolved() || !self.queue.is_empty() || !self.rexmit_queue.is_empty()
    }
}
