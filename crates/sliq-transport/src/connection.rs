//! # Connection
//!
//! One endpoint of a SLIQ association: the tag-based three-way handshake
//! with congestion-control negotiation, the stream map, inbound datagram
//! demultiplexing, outbound datagram assembly, the 32-bit microsecond
//! connection clock, and graceful/reset teardown.
//!
//! The connection is sans-IO. The transport layer calls
//! [`Connection::on_datagram`] for every UDP payload received,
//! [`Connection::poll_transmit`] for payloads to send, and
//! [`Connection::on_timeout`] when the deadline from
//! [`Connection::poll_timeout`] passes. All entry points take the current
//! connection-clock reading, so drivers may run on a virtual clock.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::cc::{AckInfo, CcAdapter, SendInfo};
use crate::pool::PacketPool;
use crate::seq::{PktSeq, PktTimestamp};
use crate::stats::{ConnStats, LossEstimator};
use crate::stream::{RecvError, SendError, Stream, StreamConfig};
use crate::wire::{
    self, CcAlgEntry, CloseReason, ConnCloseHdr, ConnHandshakeHdr, ConnResetCode, ConnResetHdr,
    FecPktType, MsgTag, SliqHeader, StreamCreateHdr, StreamErrorCode, StreamResetHdr,
    MIN_DATAGRAM_LEN,
};

/// Default path MTU bound for assembled datagrams.
pub const DEFAULT_MTU: usize = 1280;

const DEFAULT_POOL_CAPACITY: usize = 4096;
const DEFAULT_IDLE_TIMEOUT_US: u64 = 30_000_000;

/// Retransmission interval for handshake and stream-create messages,
/// which have no ACK machinery of their own.
const CTRL_REXMIT_US: u32 = 500_000;

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub role: Role,
    /// Client: the proposal list. Server: the supported set.
    pub cc_algs: Vec<CcAlgEntry>,
    pub mtu: usize,
    pub pool_capacity: usize,
    pub idle_timeout_us: u64,
}

impl ConnectionConfig {
    pub fn new(role: Role, cc_algs: Vec<CcAlgEntry>) -> Self {
        ConnectionConfig {
            role,
            cc_algs,
            mtu: DEFAULT_MTU,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            idle_timeout_us: DEFAULT_IDLE_TIMEOUT_US,
        }
    }
}

// ─── Errors / Events ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("peer rejected the handshake")]
    HandshakeRejected,
    #[error("peer reset the connection")]
    PeerReset,
    #[error("connection idle timeout")]
    IdleTimeout,
    #[error("handshake not complete")]
    NotEstablished,
    #[error("no such stream {0}")]
    UnknownStream(u8),
    #[error("stream id {0} already in use")]
    StreamExists(u8),
    #[error("connection is closed")]
    Closed,
}

/// Lifecycle and stream notifications for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    Established,
    HandshakeRejected,
    StreamOpened(u8),
    StreamReset {
        stream_id: u8,
        error: StreamErrorCode,
    },
    PeerClosed(CloseReason),
    PeerReset(ConnResetCode),
    IdleTimeout,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    /// Hello sent (client) or hello answered (server); confirm pending.
    Connecting,
    Established,
    Closing,
    Closed,
}

// ─── Inner Payload Classification ───────────────────────────────────────────

/// First-byte classification of payloads on the reserved control streams.
/// The core forwards these opaquely; it never parses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerPayloadKind {
    Qlam,
    Cce,
    Lrm,
    Lsa,
    Kupd,
    Rrm,
    Ipv4,
    Opaque,
}

/// Classify an inner payload by stream id and leading byte.
pub fn classify_inner(stream_id: u8, payload: &[u8]) -> InnerPayloadKind {
    let Some(&first) = payload.first() else {
        return InnerPayloadKind::Opaque;
    };
    match (stream_id, first) {
        (1, 0x10) => InnerPayloadKind::Qlam,
        (5, 0x11) => InnerPayloadKind::Cce,
        (5, 0x12) => InnerPayloadKind::Lrm,
        (5, 0x13) => InnerPayloadKind::Lsa,
        (5, 0x14) => InnerPayloadKind::Kupd,
        (7, 0x16) => InnerPayloadKind::Rrm,
        (3 | 7, b) if b >> 4 == 4 => InnerPayloadKind::Ipv4,
        _ => InnerPayloadKind::Opaque,
    }
}

// ─── Connection ─────────────────────────────────────────────────────────────

pub struct Connection {
    config: ConnectionConfig,
    state: ConnState,
    streams: BTreeMap<u8, Stream>,
    pool: PacketPool,
    cc: CcAdapter,
    stats: ConnStats,
    loss_est: LossEstimator,
    /// Control headers awaiting their own datagrams.
    outbox: VecDeque<Vec<SliqHeader>>,
    events: VecDeque<ConnEvent>,
    /// Our most recent handshake timestamp (matched against echoes).
    hello_ts: PktTimestamp,
    /// Handshake round-trip sample, seeds stream RTT estimators.
    handshake_rtt_us: Option<f64>,
    last_activity: PktTimestamp,
    started: bool,
    /// Identity of the latest new data arrival, for Received Packet Count.
    last_rcvd_data: Option<(u8, u8, PktSeq)>,
    /// Pacing gate for the next data transmission.
    next_send_at: PktTimestamp,
    /// A built Data header that did not fit behind a datagram's
    /// chainables; it leads the next datagram.
    staged_data: Option<crate::wire::DataHdr>,
    /// Handshake message re-sent on a timer until answered.
    hs_resend: Option<ConnHandshakeHdr>,
    hs_rexmit_at: Option<PktTimestamp>,
    /// Stream creates awaiting the peer's ACK form, with resend deadlines.
    pending_creates: BTreeMap<u8, (StreamCreateHdr, PktTimestamp)>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let pool = PacketPool::new(config.pool_capacity);
        Connection {
            pool,
            cc: CcAdapter::new(&[]),
            state: ConnState::Idle,
            streams: BTreeMap::new(),
            stats: ConnStats::new(),
            loss_est: LossEstimator::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            hello_ts: PktTimestamp(0),
            handshake_rtt_us: None,
            last_activity: PktTimestamp(0),
            started: false,
            last_rcvd_data: None,
            next_send_at: PktTimestamp(0),
            staged_data: None,
            hs_resend: None,
            hs_rexmit_at: None,
            pending_creates: BTreeMap::new(),
            config,
        }
    }

    /// Largest payload a single Data packet can carry inside the MTU.
    pub fn max_payload(&self) -> usize {
        self.config.mtu.saturating_sub(64)
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    pub fn poll_event(&mut self) -> Option<ConnEvent> {
        self.events.pop_front()
    }

    pub fn stream(&self, stream_id: u8) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn stream_mut(&mut self, stream_id: u8) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Current loss-rate estimate derived from the peer's receive counts.
    pub fn loss_rate(&self) -> f64 {
        self.loss_est.per()
    }

    // ─── Handshake ──────────────────────────────────────────────────────

    /// Client entry point: send the hello.
    pub fn connect(&mut self, now: PktTimestamp) {
        if self.config.role != Role::Client || self.state != ConnState::Idle {
            return;
        }
        self.hello_ts = now;
        self.last_activity = now;
        self.started = true;
        let hello = ConnHandshakeHdr {
            tag: MsgTag::ClientHello,
            ts: now,
            echo_ts: PktTimestamp(0),
            cc_algs: self.config.cc_algs.clone(),
        };
        self.outbox
            .push_back(vec![SliqHeader::ConnHandshake(hello.clone())]);
        self.hs_resend = Some(hello);
        self.hs_rexmit_at = Some(now.add_micros(CTRL_REXMIT_US));
        self.state = ConnState::Connecting;
        debug!("client hello queued");
    }

    fn on_handshake(&mut self, hdr: &ConnHandshakeHdr, now: PktTimestamp) {
        match (self.config.role, hdr.tag, self.state) {
            (Role::Server, MsgTag::ClientHello, ConnState::Idle) => {
                self.started = true;
                let supported: Vec<CcAlgEntry> = hdr
                    .cc_algs
                    .iter()
                    .filter(|e| {
                        self.config
                            .cc_algs
                            .iter()
                            .any(|s| s.cc_type == e.cc_type)
                    })
                    .copied()
                    .collect();
                if supported.is_empty() {
                    self.outbox
                        .push_back(vec![SliqHeader::ConnHandshake(ConnHandshakeHdr {
                            tag: MsgTag::Reject,
                            ts: now,
                            echo_ts: hdr.ts,
                            cc_algs: Vec::new(),
                        })]);
                    self.state = ConnState::Closed;
                    self.events.push_back(ConnEvent::HandshakeRejected);
                    return;
                }
                self.cc = CcAdapter::new(&supported);
                self.hello_ts = now;
                let reply = ConnHandshakeHdr {
                    tag: MsgTag::ServerHello,
                    ts: now,
                    echo_ts: hdr.ts,
                    cc_algs: supported,
                };
                self.outbox
                    .push_back(vec![SliqHeader::ConnHandshake(reply.clone())]);
                self.hs_resend = Some(reply);
                self.hs_rexmit_at = Some(now.add_micros(CTRL_REXMIT_US));
                self.state = ConnState::Connecting;
            }
            (Role::Client, MsgTag::ServerHello, ConnState::Connecting) => {
                if hdr.cc_algs.is_empty() {
                    self.state = ConnState::Closed;
                    self.events.push_back(ConnEvent::HandshakeRejected);
                    return;
                }
                if hdr.echo_ts == self.hello_ts {
                    self.handshake_rtt_us = Some(now.micros_since(hdr.echo_ts) as f64);
                }
                self.cc = CcAdapter::new(&hdr.cc_algs);
                self.outbox
                    .push_back(vec![SliqHeader::ConnHandshake(ConnHandshakeHdr {
                        tag: MsgTag::ClientConfirm,
                        ts: now,
                        echo_ts: hdr.ts,
                        cc_algs: hdr.cc_algs.clone(),
                    })]);
                self.hs_resend = None;
                self.hs_rexmit_at = None;
                self.state = ConnState::Established;
                self.events.push_back(ConnEvent::Established);
                debug!("handshake complete (client)");
            }
            (Role::Client, MsgTag::ServerHello, ConnState::Established) => {
                // Our confirm was lost; answer the repeated hello again.
                self.outbox
                    .push_back(vec![SliqHeader::ConnHandshake(ConnHandshakeHdr {
                        tag: MsgTag::ClientConfirm,
                        ts: now,
                        echo_ts: hdr.ts,
                        cc_algs: hdr.cc_algs.clone(),
                    })]);
            }
            (Role::Server, MsgTag::ClientConfirm, ConnState::Connecting) => {
                if hdr.echo_ts == self.hello_ts {
                    self.handshake_rtt_us = Some(now.micros_since(hdr.echo_ts) as f64);
                }
                self.hs_resend = None;
                self.hs_rexmit_at = None;
                self.state = ConnState::Established;
                self.events.push_back(ConnEvent::Established);
                debug!("handshake complete (server)");
            }
            (Role::Server, MsgTag::ClientHello, ConnState::Connecting) => {
                // Repeated hello: our answer was lost, send it again.
                if let Some(reply) = self.hs_resend.clone() {
                    self.outbox
                        .push_back(vec![SliqHeader::ConnHandshake(reply)]);
                }
            }
            (_, MsgTag::Reject, _) => {
                self.hs_resend = None;
                self.hs_rexmit_at = None;
                self.state = ConnState::Closed;
                self.events.push_back(ConnEvent::HandshakeRejected);
            }
            _ => trace!(tag = ?hdr.tag, state = ?self.state, "handshake message ignored"),
        }
    }

    // ─── Stream Management ──────────────────────────────────────────────

    /// Open a stream toward the peer. Refused until the handshake confirm.
    pub fn create_stream(
        &mut self,
        config: StreamConfig,
        now: PktTimestamp,
    ) -> Result<u8, ConnectionError> {
        if self.state != ConnState::Established {
            return Err(ConnectionError::NotEstablished);
        }
        let id = config.stream_id;
        if id == 0 {
            return Err(ConnectionError::UnknownStream(0));
        }
        if self.streams.contains_key(&id) {
            return Err(ConnectionError::StreamExists(id));
        }
        let mut stream = Stream::new(config.clone(), config.init_seq);
        if let Some(rtt) = self.handshake_rtt_us {
            stream.seed_rtt(rtt);
        }
        let hdr = config.to_create_hdr(false);
        self.outbox
            .push_back(vec![SliqHeader::StreamCreate(hdr.clone())]);
        self.pending_creates
            .insert(id, (hdr, now.add_micros(CTRL_REXMIT_US)));
        self.streams.insert(id, stream);
        self.touch(now);
        Ok(id)
    }

    fn on_stream_create(&mut self, hdr: &StreamCreateHdr, now: PktTimestamp) {
        if self.state != ConnState::Established {
            trace!(stream = hdr.stream_id, "stream create before confirm refused");
            return;
        }
        if hdr.ack {
            if self.pending_creates.remove(&hdr.stream_id).is_some() {
                if let Some(stream) = self.streams.get_mut(&hdr.stream_id) {
                    stream.on_create_acked();
                    self.events.push_back(ConnEvent::StreamOpened(hdr.stream_id));
                }
            }
            return;
        }
        if !self.streams.contains_key(&hdr.stream_id) {
            let config = StreamConfig::from_create_hdr(hdr);
            let mut stream = Stream::new(config, hdr.init_seq);
            if let Some(rtt) = self.handshake_rtt_us {
                stream.seed_rtt(rtt);
            }
            stream.on_create_acked();
            self.streams.insert(hdr.stream_id, stream);
            self.events.push_back(ConnEvent::StreamOpened(hdr.stream_id));
        }
        // Answer (and re-answer a duplicate) with the ACK form.
        let mut ack = hdr.clone();
        ack.ack = true;
        self.outbox.push_back(vec![SliqHeader::StreamCreate(ack)]);
        self.touch(now);
    }

    /// Queue a payload on a stream.
    pub fn send(
        &mut self,
        stream_id: u8,
        payload: Bytes,
        now: PktTimestamp,
    ) -> Result<(), SendError> {
        if payload.len() > self.max_payload() {
            return Err(SendError::PayloadTooLarge);
        }
        let per = self.loss_est.per();
        let stream = match self.streams.get_mut(&stream_id) {
            Some(s) => s,
            None => return Err(SendError::StreamClosed),
        };
        if per > 0.0 {
            stream.set_loss_rate(per);
        }
        stream.send(&mut self.pool, payload, now)
    }

    /// Deliver the next payload from a stream.
    pub fn recv(&mut self, stream_id: u8) -> Result<Bytes, RecvError> {
        match self.streams.get_mut(&stream_id) {
            Some(s) => s.recv(),
            None => Err(RecvError::StreamClosed),
        }
    }

    /// Send FIN on a stream.
    pub fn close_stream(&mut self, stream_id: u8) -> Result<(), ConnectionError> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(ConnectionError::UnknownStream(stream_id))?;
        stream.close(&mut self.pool);
        Ok(())
    }

    /// Reset a stream in both directions.
    pub fn reset_stream(
        &mut self,
        stream_id: u8,
        error: StreamErrorCode,
    ) -> Result<(), ConnectionError> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(ConnectionError::UnknownStream(stream_id))?;
        let hdr = stream.reset(&mut self.pool, error);
        self.outbox.push_back(vec![SliqHeader::StreamReset(hdr)]);
        Ok(())
    }

    // ─── Teardown ───────────────────────────────────────────────────────

    /// Graceful close.
    pub fn close(&mut self, reason: CloseReason, now: PktTimestamp) {
        if matches!(self.state, ConnState::Closed | ConnState::Closing) {
            return;
        }
        self.outbox.push_back(vec![SliqHeader::ConnClose(ConnCloseHdr {
            ack: false,
            reason,
        })]);
        self.state = ConnState::Closing;
        self.touch(now);
    }

    /// Abort with a reset; the peer will not respond.
    pub fn reset(&mut self, error: ConnResetCode) {
        self.outbox
            .push_back(vec![SliqHeader::ConnReset(ConnResetHdr { error })]);
        self.state = ConnState::Closed;
        self.events.push_back(ConnEvent::Closed);
    }

    fn on_close(&mut self, hdr: &ConnCloseHdr) {
        if hdr.ack {
            if self.state == ConnState::Closing {
                self.state = ConnState::Closed;
                self.events.push_back(ConnEvent::Closed);
            }
            return;
        }
        // Peer-initiated close (or the closing race): acknowledge and stop.
        self.outbox.push_back(vec![SliqHeader::ConnClose(ConnCloseHdr {
            ack: true,
            reason: hdr.reason,
        })]);
        let was_closing = self.state == ConnState::Closing;
        self.state = ConnState::Closed;
        if !was_closing {
            self.events.push_back(ConnEvent::PeerClosed(hdr.reason));
        }
        self.events.push_back(ConnEvent::Closed);
    }

    // ─── Inbound ────────────────────────────────────────────────────────

    /// Feed one received UDP payload.
    pub fn on_datagram(&mut self, datagram: &[u8], now: PktTimestamp) {
        if datagram.len() < MIN_DATAGRAM_LEN {
            return; // silently discarded
        }
        let headers = match wire::parse_datagram(datagram) {
            Ok(h) => h,
            Err(err) => {
                self.stats.malformed_frames += 1;
                warn!(%err, "dropping malformed datagram");
                return;
            }
        };
        self.touch(now);
        for hdr in &headers {
            match hdr {
                SliqHeader::ConnHandshake(h) => self.on_handshake(h, now),
                SliqHeader::ConnReset(h) => {
                    self.state = ConnState::Closed;
                    self.events.push_back(ConnEvent::PeerReset(h.error));
                    self.events.push_back(ConnEvent::Closed);
                }
                SliqHeader::ConnClose(h) => self.on_close(h),
                SliqHeader::StreamCreate(h) => self.on_stream_create(h, now),
                SliqHeader::StreamReset(h) => self.on_stream_reset(h),
                SliqHeader::Data(h) => self.on_data(h, now),
                SliqHeader::Ack(h) => self.on_ack(h, now),
                SliqHeader::CcSync(h) => self.cc.on_sync(h),
                SliqHeader::RcvdPktCnt(h) => {
                    self.loss_est.on_report(h.count, self.stats.data_sent);
                    let per = self.loss_est.per();
                    if per > 0.0 {
                        for stream in self.streams.values_mut() {
                            stream.set_loss_rate(per);
                        }
                    }
                }
                SliqHeader::CcPktTrain(h) => self.cc.on_pkt_train(h),
            }
        }
    }

    fn on_stream_reset(&mut self, hdr: &StreamResetHdr) {
        if let Some(stream) = self.streams.get_mut(&hdr.stream_id) {
            stream.on_peer_reset(&mut self.pool);
            self.events.push_back(ConnEvent::StreamReset {
                stream_id: hdr.stream_id,
                error: hdr.error,
            });
        }
    }

    fn on_data(&mut self, hdr: &crate::wire::DataHdr, now: PktTimestamp) {
        let Some(stream) = self.streams.get_mut(&hdr.stream_id) else {
            trace!(stream = hdr.stream_id, "data for unknown stream dropped");
            return;
        };
        if hdr.move_fwd.is_some() {
            self.stats.move_fwd_rcvd += 1;
        }
        let is_new = stream.on_data(hdr, now);
        if is_new {
            self.stats.data_rcvd += 1;
            self.last_rcvd_data = Some((hdr.stream_id, hdr.rexmit, hdr.seq));
        } else {
            self.stats.duplicates_rcvd += 1;
        }
    }

    fn on_ack(&mut self, hdr: &crate::wire::AckHdr, now: PktTimestamp) {
        self.stats.acks_rcvd += 1;
        let Some(stream) = self.streams.get_mut(&hdr.stream_id) else {
            return;
        };
        let before = stream.rtt().samples();
        let escalate = stream.on_ack(&mut self.pool, hdr, now);
        let rtt_us = (stream.rtt().samples() > before).then(|| stream.rtt().srtt_us());
        self.cc.on_ack(
            self.cc.active_id(),
            &AckInfo {
                stream_id: hdr.stream_id,
                seq: hdr.ne_seq,
                now,
                rtt_us,
            },
        );
        if let Some(error) = escalate {
            let reset = stream.reset(&mut self.pool, error);
            self.outbox.push_back(vec![SliqHeader::StreamReset(reset)]);
            self.events.push_back(ConnEvent::StreamReset {
                stream_id: hdr.stream_id,
                error,
            });
        }
    }

    // ─── Outbound ───────────────────────────────────────────────────────

    /// Produce the next datagram to put on the wire, if any.
    pub fn poll_transmit(&mut self, now: PktTimestamp) -> Option<Bytes> {
        // Control messages ride alone, in order.
        if let Some(headers) = self.outbox.pop_front() {
            let buf = wire::emit_datagram(&headers).ok()?;
            return Some(buf.freeze());
        }
        if self.state != ConnState::Established {
            return None;
        }

        let mut headers: Vec<SliqHeader> = Vec::new();
        let mut budget = self.config.mtu;

        // Opportunistic chainables: due ACKs, receive-count report, CC sync.
        let ack_streams: Vec<u8> = self
            .streams
            .iter()
            .filter(|(_, s)| s.ack_due(now))
            .map(|(&id, _)| id)
            .collect();
        let mut spill: Vec<SliqHeader> = Vec::new();
        for id in ack_streams {
            if let Some(stream) = self.streams.get_mut(&id) {
                for ack in stream.build_acks(now) {
                    self.stats.acks_sent += 1;
                    let len = ack.encoded_len();
                    if len + wire::RCVD_PKT_CNT_LEN <= budget {
                        budget -= len;
                        headers.push(SliqHeader::Ack(ack));
                    } else {
                        spill.push(SliqHeader::Ack(ack));
                    }
                }
            }
        }
        // ACK headers beyond this datagram's budget ride their own
        // chainable-only datagrams; dropping them would stall the sender
        // into timer-driven retransmissions.
        if !spill.is_empty() {
            let mut chunk: Vec<SliqHeader> = Vec::new();
            let mut chunk_len = 0usize;
            for ack in spill {
                let len = match &ack {
                    SliqHeader::Ack(a) => a.encoded_len(),
                    _ => 0,
                };
                if chunk_len + len > self.config.mtu && !chunk.is_empty() {
                    self.outbox.push_back(std::mem::take(&mut chunk));
                    chunk_len = 0;
                }
                chunk_len += len;
                chunk.push(ack);
            }
            if !chunk.is_empty() {
                self.outbox.push_back(chunk);
            }
        }
        if !headers.is_empty() {
            if let Some((stream_id, rexmit, seq)) = self.last_rcvd_data {
                headers.push(SliqHeader::RcvdPktCnt(wire::RcvdPktCntHdr {
                    stream_id,
                    rexmit,
                    seq,
                    count: self.stats.data_rcvd as u32,
                }));
                budget = budget.saturating_sub(wire::RCVD_PKT_CNT_LEN);
            }
        }
        for sync in self.cc.take_syncs() {
            if budget < wire::CC_SYNC_LEN {
                break;
            }
            budget -= wire::CC_SYNC_LEN;
            headers.push(SliqHeader::CcSync(sync));
        }

        // One terminal Data header, highest priority first, gated by CC
        // admission and pacing. A previously staged packet leads.
        let data = match self.staged_data.take() {
            Some(hdr) => Some(hdr),
            None => self.next_data(now, budget),
        };
        if let Some(hdr) = data {
            if hdr.encoded_len() <= budget || headers.is_empty() {
                headers.push(SliqHeader::Data(hdr));
            } else {
                // Too big behind this datagram's chainables; it leads the
                // next datagram instead.
                self.staged_data = Some(hdr);
            }
        }

        if headers.is_empty() {
            return None;
        }
        match wire::emit_datagram(&headers) {
            Ok(buf) => Some(buf.freeze()),
            Err(err) => {
                warn!(%err, "datagram assembly failed");
                None
            }
        }
    }

    fn next_data(&mut self, now: PktTimestamp, budget: usize) -> Option<crate::wire::DataHdr> {
        if self.next_send_at.is_after(now) {
            return None;
        }
        let mut order: Vec<(u8, u8)> = self
            .streams
            .iter()
            .filter(|(_, s)| s.has_transmittable(now))
            .map(|(&id, s)| (s.priority(), id))
            .collect();
        order.sort();
        for (_, id) in order {
            let Some(stream) = self.streams.get_mut(&id) else { continue };
            if !self.cc.can_send(now, self.config.mtu.min(budget)) {
                // Admission blocked: revisit after one pacing interval so
                // the driver does not spin.
                let backoff = self.cc.pacing_interval_us(self.config.mtu).max(1_000);
                self.next_send_at = now.add_micros(backoff.min(u32::MAX as u64 / 2) as u32);
                return None;
            }
            let Some(hdr) = stream.next_transmittable(&mut self.pool, now, self.cc.active_id())
            else {
                continue;
            };
            self.stats.data_sent += 1;
            if hdr.rexmit > 0 {
                self.stats.retransmissions += 1;
            }
            if hdr.fec.is_some_and(|f| f.pkt_type == FecPktType::Encoded) {
                self.stats.coded_sent += 1;
            }
            if hdr.move_fwd.is_some() {
                self.stats.move_fwd_sent += 1;
            }
            self.cc.on_data_sent(&SendInfo {
                stream_id: id,
                seq: hdr.seq,
                bytes: hdr.encoded_len(),
                rexmit: hdr.rexmit,
                now,
            });
            let pace = self.cc.pacing_interval_us(hdr.encoded_len());
            self.next_send_at = now.add_micros(pace.min(u32::MAX as u64 / 2) as u32);
            return Some(hdr);
        }
        None
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    fn touch(&mut self, now: PktTimestamp) {
        self.last_activity = now;
    }

    fn idle_deadline(&self) -> Option<PktTimestamp> {
        if !self.started || self.state == ConnState::Closed {
            return None;
        }
        Some(
            self.last_activity
                .add_micros(self.config.idle_timeout_us.min(u32::MAX as u64 / 2) as u32),
        )
    }

    /// Earliest instant the driver must call [`Connection::on_timeout`].
    pub fn poll_timeout(&self, now: PktTimestamp) -> Option<PktTimestamp> {
        let mut deadline = self.idle_deadline();
        let ctrl = self
            .hs_rexmit_at
            .into_iter()
            .chain(self.pending_creates.values().map(|(_, at)| *at));
        for t in ctrl {
            deadline = Some(match deadline {
                None => t,
                Some(d) if t.is_after(d) => d,
                Some(_) => t,
            });
        }
        for stream in self.streams.values() {
            if let Some(t) = stream.next_timeout() {
                deadline = Some(match deadline {
                    None => t,
                    Some(d) if t.is_after(d) => d,
                    Some(_) => t,
                });
            }
        }
        if self
            .streams
            .values()
            .any(|s| s.has_transmittable(now))
        {
            let pace = self.next_send_at;
            deadline = Some(match deadline {
                None => pace,
                Some(d) if pace.is_after(d) => d,
                Some(_) => pace,
            });
        }
        deadline
    }

    /// Drive expired timers: retransmissions, delayed ACKs, idle teardown.
    pub fn on_timeout(&mut self, now: PktTimestamp) {
        if let Some(idle_at) = self.idle_deadline() {
            if !idle_at.is_after(now)
                && matches!(self.state, ConnState::Established | ConnState::Connecting)
            {
                debug!("idle timeout");
                self.state = ConnState::Closed;
                self.events.push_back(ConnEvent::IdleTimeout);
                self.events.push_back(ConnEvent::Closed);
                return;
            }
        }
        // Unanswered control messages go out again.
        if let (Some(at), Some(resend)) = (self.hs_rexmit_at, self.hs_resend.clone()) {
            if !at.is_after(now) && self.state == ConnState::Connecting {
                self.outbox
                    .push_back(vec![SliqHeader::ConnHandshake(resend)]);
                self.hs_rexmit_at = Some(now.add_micros(CTRL_REXMIT_US));
            }
        }
        if self.state == ConnState::Established {
            for (hdr, at) in self.pending_creates.values_mut() {
                if !at.is_after(now) {
                    self.outbox
                        .push_back(vec![SliqHeader::StreamCreate(hdr.clone())]);
                    *at = now.add_micros(CTRL_REXMIT_US);
                }
            }
        }
        let ids: Vec<u8> = self.streams.keys().copied().collect();
        for id in ids {
            let Some(stream) = self.streams.get_mut(&id) else { continue };
            if let Some(error) = stream.on_timer(&mut self.pool, now) {
                let reset = stream.reset(&mut self.pool, error);
                self.outbox.push_back(vec![SliqHeader::StreamReset(reset)]);
                self.events.push_back(ConnEvent::StreamReset {
                    stream_id: id,
                    error,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::CcType;

    fn entry(cc_type: CcType) -> CcAlgEntry {
        CcAlgEntry {
            cc_type,
            deterministic: false,
            pacing: false,
            params: 0,
        }
    }

    fn client_server(
        client_algs: Vec<CcAlgEntry>,
        server_algs: Vec<CcAlgEntry>,
    ) -> (Connection, Connection) {
        (
            Connection::new(ConnectionConfig::new(Role::Client, client_algs)),
            Connection::new(ConnectionConfig::new(Role::Server, server_algs)),
        )
    }

    /// Shuttle every pending datagram both ways until quiescent.
    fn pump(a: &mut Connection, b: &mut Connection, now: PktTimestamp) {
        loop {
            let mut moved = false;
            while let Some(dgram) = a.poll_transmit(now) {
                b.on_datagram(&dgram, now);
                moved = true;
            }
            while let Some(dgram) = b.poll_transmit(now) {
                a.on_datagram(&dgram, now);
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    fn established_pair() -> (Connection, Connection) {
        let (mut client, mut server) = client_server(
            vec![entry(CcType::CubicBytes), entry(CcType::RenoBytes)],
            vec![entry(CcType::CubicBytes)],
        );
        client.connect(PktTimestamp(0));
        pump(&mut client, &mut server, PktTimestamp(1_000));
        assert_eq!(client.state(), ConnState::Established);
        assert_eq!(server.state(), ConnState::Established);
        (client, server)
    }

    #[test]
    fn three_way_handshake_establishes_both() {
        let (mut client, mut server) = established_pair();
        assert_eq!(client.poll_event(), Some(ConnEvent::Established));
        assert_eq!(server.poll_event(), Some(ConnEvent::Established));
    }

    #[test]
    fn handshake_rejected_when_no_common_algorithm() {
        let (mut client, mut server) = client_server(
            vec![entry(CcType::FixedRate)],
            vec![
                entry(CcType::CubicBytes),
                entry(CcType::RenoBytes),
                entry(CcType::TcpCubic),
            ],
        );
        client.connect(PktTimestamp(0));
        pump(&mut client, &mut server, PktTimestamp(500));

        assert_eq!(client.state(), ConnState::Closed);
        assert_eq!(client.poll_event(), Some(ConnEvent::HandshakeRejected));
        assert_eq!(server.poll_event(), Some(ConnEvent::HandshakeRejected));
        // No streams can be created after rejection.
        assert_eq!(
            client.create_stream(StreamConfig::default(), PktTimestamp(600)),
            Err(ConnectionError::NotEstablished)
        );
    }

    #[test]
    fn stream_create_refused_before_established() {
        let (mut client, _server) = client_server(
            vec![entry(CcType::CubicBytes)],
            vec![entry(CcType::CubicBytes)],
        );
        client.connect(PktTimestamp(0));
        assert_eq!(
            client.create_stream(StreamConfig::default(), PktTimestamp(1)),
            Err(ConnectionError::NotEstablished)
        );
    }

    #[test]
    fn stream_create_exchange_opens_both_sides() {
        let (mut client, mut server) = established_pair();
        let id = client
            .create_stream(
                StreamConfig {
                    stream_id: 2,
                    ..Default::default()
                },
                PktTimestamp(2_000),
            )
            .unwrap();
        pump(&mut client, &mut server, PktTimestamp(3_000));

        assert_eq!(id, 2);
        assert!(client.stream(2).is_some());
        assert!(server.stream(2).is_some());
        let client_events: Vec<_> = std::iter::from_fn(|| client.poll_event()).collect();
        assert!(client_events.contains(&ConnEvent::StreamOpened(2)));
    }

    #[test]
    fn duplicate_stream_id_rejected() {
        let (mut client, mut server) = established_pair();
        let config = StreamConfig {
            stream_id: 3,
            ..Default::default()
        };
        client.create_stream(config.clone(), PktTimestamp(0)).unwrap();
        pump(&mut client, &mut server, PktTimestamp(0));
        assert_eq!(
            client.create_stream(config, PktTimestamp(0)),
            Err(ConnectionError::StreamExists(3))
        );
    }

    #[test]
    fn data_flows_end_to_end() {
        let (mut client, mut server) = established_pair();
        client
            .create_stream(
                StreamConfig {
                    stream_id: 2,
                    ..Default::default()
                },
                PktTimestamp(0),
            )
            .unwrap();
        pump(&mut client, &mut server, PktTimestamp(0));

        for i in 0..10u8 {
            client
                .send(2, Bytes::from(vec![i; 100]), PktTimestamp(1_000))
                .unwrap();
        }
        pump(&mut client, &mut server, PktTimestamp(2_000));

        let mut got = Vec::new();
        while let Ok(p) = server.recv(2) {
            got.push(p);
        }
        assert_eq!(got.len(), 10);
        for (i, p) in got.iter().enumerate() {
            assert_eq!(p[0], i as u8);
        }
        assert_eq!(server.stats().data_rcvd, 10);
    }

    #[test]
    fn acks_return_and_clear_in_flight() {
        let (mut client, mut server) = established_pair();
        client
            .create_stream(
                StreamConfig {
                    stream_id: 2,
                    ..Default::default()
                },
                PktTimestamp(0),
            )
            .unwrap();
        pump(&mut client, &mut server, PktTimestamp(0));

        client.send(2, Bytes::from_static(b"ping"), PktTimestamp(0)).unwrap();
        pump(&mut client, &mut server, PktTimestamp(1_000));
        // Let the delayed-ACK timer pass, then pump the ACK back.
        pump(&mut client, &mut server, PktTimestamp(50_000));

        assert_eq!(client.stream(2).unwrap().in_flight(), 0);
        assert!(client.stats().data_sent >= 1);
        assert!(server.stats().acks_sent >= 1);
        assert!(client.stats().acks_rcvd >= 1);
    }

    #[test]
    fn graceful_close_race_both_end_closed() {
        let (mut client, mut server) = established_pair();
        client.close(CloseReason::Normal, PktTimestamp(0));
        server.close(CloseReason::Normal, PktTimestamp(0));
        pump(&mut client, &mut server, PktTimestamp(100));

        assert_eq!(client.state(), ConnState::Closed);
        assert_eq!(server.state(), ConnState::Closed);
        let client_events: Vec<_> = std::iter::from_fn(|| client.poll_event()).collect();
        let server_events: Vec<_> = std::iter::from_fn(|| server.poll_event()).collect();
        assert!(client_events.contains(&ConnEvent::Closed));
        assert!(server_events.contains(&ConnEvent::Closed));
    }

    #[test]
    fn peer_reset_surfaces_and_closes() {
        let (mut client, mut server) = established_pair();
        client.reset(ConnResetCode::InternalError);
        let dgram = client.poll_transmit(PktTimestamp(0)).unwrap();
        server.on_datagram(&dgram, PktTimestamp(0));

        assert_eq!(server.state(), ConnState::Closed);
        assert_eq!(
            server.poll_event(),
            Some(ConnEvent::PeerReset(ConnResetCode::InternalError))
        );
    }

    #[test]
    fn idle_timeout_closes() {
        let (mut client, _server) = established_pair();
        let deadline = client.poll_timeout(PktTimestamp(1_000)).unwrap();
        client.on_timeout(deadline.add_micros(1));
        assert_eq!(client.state(), ConnState::Closed);
        let events: Vec<_> = std::iter::from_fn(|| client.poll_event()).collect();
        assert!(events.contains(&ConnEvent::IdleTimeout));
    }

    #[test]
    fn short_and_malformed_datagrams_dropped() {
        let (mut client, _server) = established_pair();
        client.on_datagram(&[0x20, 0x00], PktTimestamp(0));
        assert_eq!(client.stats().malformed_frames, 0, "short frames are silent");

        client.on_datagram(&[17, 0, 0, 0, 0, 0, 0], PktTimestamp(0));
        assert_eq!(client.stats().malformed_frames, 1);
        assert_eq!(client.state(), ConnState::Established);
    }

    #[test]
    fn inner_payload_classification() {
        assert_eq!(classify_inner(1, &[0x10, 1]), InnerPayloadKind::Qlam);
        assert_eq!(classify_inner(5, &[0x11]), InnerPayloadKind::Cce);
        assert_eq!(classify_inner(5, &[0x12]), InnerPayloadKind::Lrm);
        assert_eq!(classify_inner(5, &[0x13]), InnerPayloadKind::Lsa);
        assert_eq!(classify_inner(5, &[0x14]), InnerPayloadKind::Kupd);
        assert_eq!(classify_inner(7, &[0x16]), InnerPayloadKind::Rrm);
        assert_eq!(classify_inner(3, &[0x45, 0]), InnerPayloadKind::Ipv4);
        assert_eq!(classify_inner(7, &[0x45, 0]), InnerPayloadKind::Ipv4);
        assert_eq!(classify_inner(5, &[0x99]), InnerPayloadKind::Opaque);
        assert_eq!(classify_inner(2, &[]), InnerPayloadKind::Opaque);
    }

    #[test]
    fn ack_datagram_carries_receive_count() {
        let (mut client, mut server) = established_pair();
        client
            .create_stream(
                StreamConfig {
                    stream_id: 2,
                    ..Default::default()
                },
                PktTimestamp(0),
            )
            .unwrap();
        pump(&mut client, &mut server, PktTimestamp(0));
        client.send(2, Bytes::from_static(b"x"), PktTimestamp(0)).unwrap();
        while let Some(d) = client.poll_transmit(PktTimestamp(0)) {
            server.on_datagram(&d, PktTimestamp(0));
        }

        // After the ACK delay the server's datagram chains ACK + count.
        let dgram = server.poll_transmit(PktTimestamp(40_000)).unwrap();
        let headers = wire::parse_datagram(&dgram).unwrap();
        assert!(headers
            .iter()
            .any(|h| matches!(h, SliqHeader::Ack(_))));
        let count = headers.iter().find_map(|h| match h {
            SliqHeader::RcvdPktCnt(c) => Some(c.count),
            _ => None,
        });
        assert_eq!(count, Some(1));
    }
}
