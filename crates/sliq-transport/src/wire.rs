//! # SLIQ Wire Format
//!
//! One UDP payload carries one or more SLIQ headers back-to-back. The first
//! byte of every header is its type tag. Connection-level headers (types
//! 0–4), Data (32), and CC Packet Train (40) are *terminal*: nothing may
//! follow them in the same datagram. ACK (33), CC Sync (34), and Received
//! Packet Count (35) are *chainable* and may repeat before a terminal header
//! or the end of the payload.
//!
//! ## Data header (base 20 bytes, big endian)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |U|L|E|M| U |P|F|   Stream ID   | Number of TTG |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     CC ID     | Rexmit Count  |    Payload Length in Bytes    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Packet Sequence Number                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Packet Timestamp                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Packet Timestamp Delta                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Flag-gated add-ons follow the base header in order: move-forward sequence
//! (M, 4 bytes), FEC fields (E, 4 bytes), encoded packet length (L, 2 bytes),
//! then one 2-byte Time-To-Go per `num_ttg`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::seq::{PktSeq, PktTimestamp};

// ─── Header Type Tags ───────────────────────────────────────────────────────

pub const CONN_HANDSHAKE_HDR: u8 = 0;
pub const CONN_RESET_HDR: u8 = 1;
pub const CONN_CLOSE_HDR: u8 = 2;
pub const STREAM_CREATE_HDR: u8 = 3;
pub const STREAM_RESET_HDR: u8 = 4;
pub const DATA_HDR: u8 = 32;
pub const ACK_HDR: u8 = 33;
pub const CC_SYNC_HDR: u8 = 34;
pub const RCVD_PKT_CNT_HDR: u8 = 35;
pub const CC_PKT_TRAIN_HDR: u8 = 40;

/// Datagrams shorter than this are dropped without comment at the
/// connection layer.
pub const MIN_DATAGRAM_LEN: usize = 4;

/// Maximum CC algorithm entries in a handshake, per direction.
pub const MAX_CC_ALGS: usize = 16;

/// Maximum observed-packet-time records per ACK (3-bit count field).
pub const MAX_OBSERVED_TIMES: usize = 7;

/// Maximum ACK block offsets per ACK (5-bit count field).
pub const MAX_ACK_BLOCKS: usize = 31;

// ─── Framing Errors ─────────────────────────────────────────────────────────

/// Errors raised by the parse and emit contracts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// A claimed field extends past the end of the datagram.
    #[error("header fields extend past the end of the datagram")]
    MalformedFrame,
    /// A header position holds a type tag this codec does not know.
    #[error("unrecognized header type {0}")]
    UnknownHeader(u8),
    /// A variable-length header's element count disagrees with the bytes
    /// actually present.
    #[error("element count disagrees with the bytes present")]
    InconsistentCounts,
    /// Emission attempted to place a header after a terminal header.
    #[error("terminal header must be last in the datagram")]
    HeaderAfterTerminal,
    /// A field value does not fit its wire encoding.
    #[error("{0} does not fit its wire field")]
    FieldOverflow(&'static str),
}

// ─── Handshake ──────────────────────────────────────────────────────────────

/// Handshake message tags (two ASCII bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgTag {
    ClientHello = 0x4843,
    ServerHello = 0x4853,
    ClientConfirm = 0x4343,
    Reject = 0x4A52,
}

impl MsgTag {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x4843 => Some(MsgTag::ClientHello),
            0x4853 => Some(MsgTag::ServerHello),
            0x4343 => Some(MsgTag::ClientConfirm),
            0x4A52 => Some(MsgTag::Reject),
            _ => None,
        }
    }
}

/// Reserved congestion-control algorithm type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CcType {
    NoCc = 0,
    CubicBytes = 1,
    RenoBytes = 2,
    TcpCubic = 3,
    CopaConstDelta = 4,
    CopaM = 5,
    Copa2 = 6,
    Copa3 = 7,
    FixedRate = 15,
}

impl CcType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CcType::NoCc),
            1 => Some(CcType::CubicBytes),
            2 => Some(CcType::RenoBytes),
            3 => Some(CcType::TcpCubic),
            4 => Some(CcType::CopaConstDelta),
            5 => Some(CcType::CopaM),
            6 => Some(CcType::Copa2),
            7 => Some(CcType::Copa3),
            15 => Some(CcType::FixedRate),
            _ => None,
        }
    }
}

/// One negotiated congestion-control algorithm entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcAlgEntry {
    pub cc_type: CcType,
    /// Deterministic-variant flag (bit 1 of the entry flags byte).
    pub deterministic: bool,
    /// Send pacing enabled (bit 0 of the entry flags byte).
    pub pacing: bool,
    /// Algorithm-specific 32-bit parameter.
    pub params: u32,
}

const CC_ALG_DETERM_FLAG: u8 = 0x02;
const CC_ALG_PACING_FLAG: u8 = 0x01;

/// Connection Handshake header (type 0): base 12 bytes plus 8 per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnHandshakeHdr {
    pub tag: MsgTag,
    /// Sender's connection clock at transmit.
    pub ts: PktTimestamp,
    /// Echo of the peer's most recent `ts`, zero on the first hello.
    pub echo_ts: PktTimestamp,
    pub cc_algs: Vec<CcAlgEntry>,
}

pub const CONN_HANDSHAKE_BASE_LEN: usize = 12;
pub const CONN_HANDSHAKE_CC_ALG_LEN: usize = 8;

impl ConnHandshakeHdr {
    pub fn encoded_len(&self) -> usize {
        CONN_HANDSHAKE_BASE_LEN + self.cc_algs.len() * CONN_HANDSHAKE_CC_ALG_LEN
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        if self.cc_algs.len() > MAX_CC_ALGS {
            return Err(FrameError::FieldOverflow("cc algorithm count"));
        }
        buf.put_u8(CONN_HANDSHAKE_HDR);
        buf.put_u8(self.cc_algs.len() as u8);
        buf.put_u16(self.tag as u16);
        buf.put_u32(self.ts.0);
        buf.put_u32(self.echo_ts.0);
        for alg in &self.cc_algs {
            buf.put_u8(alg.cc_type as u8);
            let mut flags = 0u8;
            if alg.deterministic {
                flags |= CC_ALG_DETERM_FLAG;
            }
            if alg.pacing {
                flags |= CC_ALG_PACING_FLAG;
            }
            buf.put_u8(flags);
            buf.put_u16(0); // unused
            buf.put_u32(alg.params);
        }
        Ok(())
    }

    /// Decode after the type byte has been consumed.
    fn decode(buf: &mut impl Buf) -> Result<Self, FrameError> {
        if buf.remaining() < CONN_HANDSHAKE_BASE_LEN - 1 {
            return Err(FrameError::MalformedFrame);
        }
        let num_cc = buf.get_u8() as usize;
        let tag = MsgTag::from_u16(buf.get_u16()).ok_or(FrameError::MalformedFrame)?;
        let ts = PktTimestamp(buf.get_u32());
        let echo_ts = PktTimestamp(buf.get_u32());
        if num_cc > MAX_CC_ALGS || buf.remaining() != num_cc * CONN_HANDSHAKE_CC_ALG_LEN {
            return Err(FrameError::InconsistentCounts);
        }
        let mut cc_algs = Vec::with_capacity(num_cc);
        for _ in 0..num_cc {
            let cc_type = CcType::from_u8(buf.get_u8()).ok_or(FrameError::MalformedFrame)?;
            let flags = buf.get_u8();
            let _ = buf.get_u16(); // unused
            let params = buf.get_u32();
            cc_algs.push(CcAlgEntry {
                cc_type,
                deterministic: flags & CC_ALG_DETERM_FLAG != 0,
                pacing: flags & CC_ALG_PACING_FLAG != 0,
                params,
            });
        }
        Ok(ConnHandshakeHdr {
            tag,
            ts,
            echo_ts,
            cc_algs,
        })
    }
}

// ─── Connection Reset / Close ───────────────────────────────────────────────

/// Connection Reset error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConnResetCode {
    NoError = 0,
    ReceiveCloseError = 1,
    SocketWriteError = 2,
    InternalError = 3,
}

impl ConnResetCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(ConnResetCode::NoError),
            1 => Some(ConnResetCode::ReceiveCloseError),
            2 => Some(ConnResetCode::SocketWriteError),
            3 => Some(ConnResetCode::InternalError),
            _ => None,
        }
    }
}

/// Connection Reset header (type 1): 4 bytes, no response expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnResetHdr {
    pub error: ConnResetCode,
}

pub const CONN_RESET_LEN: usize = 4;

impl ConnResetHdr {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(CONN_RESET_HDR);
        buf.put_u8(0);
        buf.put_u16(self.error as u16);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, FrameError> {
        if buf.remaining() < CONN_RESET_LEN - 1 {
            return Err(FrameError::MalformedFrame);
        }
        let _flags = buf.get_u8();
        let error = ConnResetCode::from_u16(buf.get_u16()).ok_or(FrameError::MalformedFrame)?;
        Ok(ConnResetHdr { error })
    }
}

/// Connection Close reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseReason {
    Normal = 0,
    FlowControlExcess = 1,
}

impl CloseReason {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(CloseReason::Normal),
            1 => Some(CloseReason::FlowControlExcess),
            _ => None,
        }
    }
}

/// Connection Close header (type 2): 4 bytes. The peer answers with the
/// ACK flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnCloseHdr {
    pub ack: bool,
    pub reason: CloseReason,
}

pub const CONN_CLOSE_LEN: usize = 4;
const CONN_CLOSE_ACK_FLAG: u8 = 0x01;

impl ConnCloseHdr {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(CONN_CLOSE_HDR);
        buf.put_u8(if self.ack { CONN_CLOSE_ACK_FLAG } else { 0 });
        buf.put_u16(self.reason as u16);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, FrameError> {
        if buf.remaining() < CONN_CLOSE_LEN - 1 {
            return Err(FrameError::MalformedFrame);
        }
        let flags = buf.get_u8();
        let reason = CloseReason::from_u16(buf.get_u16()).ok_or(FrameError::MalformedFrame)?;
        Ok(ConnCloseHdr {
            ack: flags & CONN_CLOSE_ACK_FLAG != 0,
            reason,
        })
    }
}

// ─── Stream Create / Reset ──────────────────────────────────────────────────

/// Per-stream delivery ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum DeliveryMode {
    Unordered = 0,
    #[default]
    Ordered = 1,
}

/// Per-stream reliability mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum ReliabilityMode {
    BestEffort = 0,
    SemiReliableArq = 1,
    SemiReliableArqFec = 2,
    #[default]
    ReliableArq = 4,
}

impl ReliabilityMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ReliabilityMode::BestEffort),
            1 => Some(ReliabilityMode::SemiReliableArq),
            2 => Some(ReliabilityMode::SemiReliableArqFec),
            4 => Some(ReliabilityMode::ReliableArq),
            _ => None,
        }
    }
}

/// Stream Create header (type 3): fixed 20 bytes. Sent by the initiating
/// endpoint; the peer answers with the same parameters and the ACK flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCreateHdr {
    pub ack: bool,
    /// Receiver may grow the flow-control window on its own.
    pub auto_tune: bool,
    /// FEC target is a delivery time in milliseconds rather than rounds.
    pub del_time: bool,
    pub stream_id: u8,
    /// 0 is the highest priority, 7 the lowest.
    pub priority: u8,
    /// Initial flow-control window, in packets.
    pub init_win_size: u32,
    pub init_seq: PktSeq,
    pub delivery: DeliveryMode,
    pub reliability: ReliabilityMode,
    /// Retransmission limit for the semi-reliable modes.
    pub rexmit_limit: u8,
    /// Target delivery rounds, or milliseconds when `del_time` is set.
    pub tgt_delivery: u16,
    /// Target packet receive probability in units of 0.0001.
    pub tgt_rcv_prob: u16,
}

pub const STREAM_CREATE_LEN: usize = 20;
const SC_ACK_FLAG: u8 = 0x20;
const SC_AUTO_TUNE_FLAG: u8 = 0x10;
const SC_DEL_TIME_FLAG: u8 = 0x08;

impl StreamCreateHdr {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        if self.priority > 7 {
            return Err(FrameError::FieldOverflow("stream priority"));
        }
        buf.put_u8(STREAM_CREATE_HDR);
        let mut flags = 0u8;
        if self.ack {
            flags |= SC_ACK_FLAG;
        }
        if self.auto_tune {
            flags |= SC_AUTO_TUNE_FLAG;
        }
        if self.del_time {
            flags |= SC_DEL_TIME_FLAG;
        }
        buf.put_u8(flags);
        buf.put_u8(self.stream_id);
        buf.put_u8(self.priority);
        buf.put_u32(self.init_win_size);
        buf.put_u32(self.init_seq.0);
        buf.put_u8(((self.delivery as u8) << 4) | (self.reliability as u8));
        buf.put_u8(self.rexmit_limit);
        buf.put_u16(self.tgt_delivery);
        buf.put_u16(self.tgt_rcv_prob);
        buf.put_u16(0); // unused
        Ok(())
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, FrameError> {
        if buf.remaining() < STREAM_CREATE_LEN - 1 {
            return Err(FrameError::MalformedFrame);
        }
        let flags = buf.get_u8();
        let stream_id = buf.get_u8();
        let priority = buf.get_u8();
        let init_win_size = buf.get_u32();
        let init_seq = PktSeq(buf.get_u32());
        let del_rel = buf.get_u8();
        let delivery = if (del_rel >> 4) & 0x01 == 1 {
            DeliveryMode::Ordered
        } else {
            DeliveryMode::Unordered
        };
        let reliability =
            ReliabilityMode::from_u8(del_rel & 0x07).ok_or(FrameError::MalformedFrame)?;
        let rexmit_limit = buf.get_u8();
        let tgt_delivery = buf.get_u16();
        let tgt_rcv_prob = buf.get_u16();
        let _ = buf.get_u16(); // unused
        Ok(StreamCreateHdr {
            ack: flags & SC_ACK_FLAG != 0,
            auto_tune: flags & SC_AUTO_TUNE_FLAG != 0,
            del_time: flags & SC_DEL_TIME_FLAG != 0,
            stream_id,
            priority,
            init_win_size,
            init_seq,
            delivery,
            reliability,
            rexmit_limit,
            tgt_delivery,
            tgt_rcv_prob,
        })
    }
}

/// Stream Reset error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamErrorCode {
    Normal = 0,
    PartialWriteError = 1,
    SocketWriteError = 2,
    FlowControlError = 3,
    TransmitQueueError = 4,
}

impl StreamErrorCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(StreamErrorCode::Normal),
            1 => Some(StreamErrorCode::PartialWriteError),
            2 => Some(StreamErrorCode::SocketWriteError),
            3 => Some(StreamErrorCode::FlowControlError),
            4 => Some(StreamErrorCode::TransmitQueueError),
            _ => None,
        }
    }
}

/// Stream Reset header (type 4): 8 bytes. Terminates both directions of
/// the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamResetHdr {
    pub stream_id: u8,
    pub error: StreamErrorCode,
    pub final_seq: PktSeq,
}

pub const STREAM_RESET_LEN: usize = 8;

impl StreamResetHdr {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(STREAM_RESET_HDR);
        buf.put_u8(0);
        buf.put_u8(self.stream_id);
        buf.put_u8(self.error as u8);
        buf.put_u32(self.final_seq.0);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, FrameError> {
        if buf.remaining() < STREAM_RESET_LEN - 1 {
            return Err(FrameError::MalformedFrame);
        }
        let _flags = buf.get_u8();
        let stream_id = buf.get_u8();
        let error = StreamErrorCode::from_u8(buf.get_u8()).ok_or(FrameError::MalformedFrame)?;
        let final_seq = PktSeq(buf.get_u32());
        Ok(StreamResetHdr {
            stream_id,
            error,
            final_seq,
        })
    }
}

// ─── Data ───────────────────────────────────────────────────────────────────

/// Role of a packet within an FEC group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FecPktType {
    Source = 0,
    Encoded = 1,
}

/// FEC fields carried by Data headers on FEC-eligible streams (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecInfo {
    pub pkt_type: FecPktType,
    /// Position within the group's degrees of freedom, 0..63.
    pub index: u8,
    /// Number of source packets in the group, 1..10.
    pub num_src: u8,
    /// Transmission round, 1..15.
    pub round: u8,
    pub group: u16,
}

/// Time-To-Go: the latency budget remaining for a packet, 2 bytes.
///
/// Split encoding: with bit 15 set, the low 15 bits are milliseconds beyond
/// one second; clear, they are a fraction of one second in units of 1/32767.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeToGo(pub u16);

impl TimeToGo {
    pub fn from_micros(us: u32) -> Self {
        if us < 1_000_000 {
            TimeToGo(((us as u64 * 32767) / 1_000_000) as u16)
        } else {
            let ms_over = ((us - 1_000_000) / 1_000).min(0x7FFF);
            TimeToGo(0x8000 | ms_over as u16)
        }
    }

    pub fn as_micros(self) -> u32 {
        if self.0 & 0x8000 != 0 {
            1_000_000 + (self.0 & 0x7FFF) as u32 * 1_000
        } else {
            ((self.0 as u64 * 1_000_000) / 32767) as u32
        }
    }
}

/// Data header (type 32): base 20 bytes plus flag-gated add-ons, then the
/// payload, which runs to the end of the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHdr {
    /// Sent to re-open a zero flow-control window.
    pub persist: bool,
    /// Final packet of the stream.
    pub fin: bool,
    pub stream_id: u8,
    /// Index of the congestion-control algorithm governing this packet.
    pub cc_id: u8,
    pub rexmit: u8,
    pub seq: PktSeq,
    pub ts: PktTimestamp,
    pub ts_delta: u32,
    /// Receiver must stop waiting for sequences below this one.
    pub move_fwd: Option<PktSeq>,
    pub fec: Option<FecInfo>,
    /// GF(2^8)-combined source lengths, present on encoded FEC packets.
    pub enc_pkt_len: Option<u16>,
    pub ttgs: Vec<TimeToGo>,
    pub payload: Bytes,
}

pub const DATA_BASE_LEN: usize = 20;
pub const DATA_MOVE_FWD_LEN: usize = 4;
pub const DATA_FEC_LEN: usize = 4;
pub const DATA_ENC_PKT_LEN_LEN: usize = 2;
pub const DATA_TTG_LEN: usize = 2;

const D_ENC_PKT_LEN_FLAG: u8 = 0x40;
const D_FEC_FLAG: u8 = 0x20;
const D_MOVE_FWD_FLAG: u8 = 0x10;
const D_PERSIST_FLAG: u8 = 0x02;
const D_FIN_FLAG: u8 = 0x01;

impl DataHdr {
    /// A bare data packet with no optional fields.
    pub fn new(stream_id: u8, seq: PktSeq, ts: PktTimestamp, payload: Bytes) -> Self {
        DataHdr {
            persist: false,
            fin: false,
            stream_id,
            cc_id: 0,
            rexmit: 0,
            seq,
            ts,
            ts_delta: 0,
            move_fwd: None,
            fec: None,
            enc_pkt_len: None,
            ttgs: Vec::new(),
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        DATA_BASE_LEN
            + self.move_fwd.map_or(0, |_| DATA_MOVE_FWD_LEN)
            + self.fec.map_or(0, |_| DATA_FEC_LEN)
            + self.enc_pkt_len.map_or(0, |_| DATA_ENC_PKT_LEN_LEN)
            + self.ttgs.len() * DATA_TTG_LEN
            + self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        if self.payload.len() > u16::MAX as usize {
            return Err(FrameError::FieldOverflow("data payload length"));
        }
        if self.ttgs.len() > u8::MAX as usize {
            return Err(FrameError::FieldOverflow("time-to-go count"));
        }
        buf.put_u8(DATA_HDR);
        let mut flags = 0u8;
        if self.enc_pkt_len.is_some() {
            flags |= D_ENC_PKT_LEN_FLAG;
        }
        if self.fec.is_some() {
            flags |= D_FEC_FLAG;
        }
        if self.move_fwd.is_some() {
            flags |= D_MOVE_FWD_FLAG;
        }
        if self.persist {
            flags |= D_PERSIST_FLAG;
        }
        if self.fin {
            flags |= D_FIN_FLAG;
        }
        buf.put_u8(flags);
        buf.put_u8(self.stream_id);
        buf.put_u8(self.ttgs.len() as u8);
        buf.put_u8(self.cc_id);
        buf.put_u8(self.rexmit);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u32(self.seq.0);
        buf.put_u32(self.ts.0);
        buf.put_u32(self.ts_delta);
        if let Some(mf) = self.move_fwd {
            buf.put_u32(mf.0);
        }
        if let Some(fec) = self.fec {
            if fec.index > 0x3F {
                return Err(FrameError::FieldOverflow("fec index"));
            }
            if fec.num_src > 0x0F || fec.round > 0x0F {
                return Err(FrameError::FieldOverflow("fec group shape"));
            }
            buf.put_u8(((fec.pkt_type as u8) << 7) | fec.index);
            buf.put_u8((fec.num_src << 4) | fec.round);
            buf.put_u16(fec.group);
        }
        if let Some(epl) = self.enc_pkt_len {
            buf.put_u16(epl);
        }
        for ttg in &self.ttgs {
            buf.put_u16(ttg.0);
        }
        buf.extend_from_slice(&self.payload);
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, FrameError> {
        if buf.remaining() < DATA_BASE_LEN - 1 {
            return Err(FrameError::MalformedFrame);
        }
        let flags = buf.get_u8();
        let stream_id = buf.get_u8();
        let num_ttg = buf.get_u8() as usize;
        let cc_id = buf.get_u8();
        let rexmit = buf.get_u8();
        let pld_len = buf.get_u16() as usize;
        let seq = PktSeq(buf.get_u32());
        let ts = PktTimestamp(buf.get_u32());
        let ts_delta = buf.get_u32();

        let move_fwd = if flags & D_MOVE_FWD_FLAG != 0 {
            if buf.remaining() < DATA_MOVE_FWD_LEN {
                return Err(FrameError::MalformedFrame);
            }
            Some(PktSeq(buf.get_u32()))
        } else {
            None
        };
        let fec = if flags & D_FEC_FLAG != 0 {
            if buf.remaining() < DATA_FEC_LEN {
                return Err(FrameError::MalformedFrame);
            }
            let type_idx = buf.get_u8();
            let src_rnd = buf.get_u8();
            let group = buf.get_u16();
            Some(FecInfo {
                pkt_type: if type_idx >> 7 == 1 {
                    FecPktType::Encoded
                } else {
                    FecPktType::Source
                },
                index: type_idx & 0x3F,
                num_src: src_rnd >> 4,
                round: src_rnd & 0x0F,
                group,
            })
        } else {
            None
        };
        let enc_pkt_len = if flags & D_ENC_PKT_LEN_FLAG != 0 {
            if buf.remaining() < DATA_ENC_PKT_LEN_LEN {
                return Err(FrameError::MalformedFrame);
            }
            Some(buf.get_u16())
        } else {
            None
        };
        if buf.remaining() < num_ttg * DATA_TTG_LEN {
            return Err(FrameError::MalformedFrame);
        }
        let mut ttgs = Vec::with_capacity(num_ttg);
        for _ in 0..num_ttg {
            ttgs.push(TimeToGo(buf.get_u16()));
        }
        if buf.remaining() != pld_len {
            return Err(FrameError::InconsistentCounts);
        }
        let payload = buf.copy_to_bytes(pld_len);
        Ok(DataHdr {
            persist: flags & D_PERSIST_FLAG != 0,
            fin: flags & D_FIN_FLAG != 0,
            stream_id,
            cc_id,
            rexmit,
            seq,
            ts,
            ts_delta,
            move_fwd,
            fec,
            enc_pkt_len,
            ttgs,
            payload,
        })
    }
}

// ─── ACK ────────────────────────────────────────────────────────────────────

/// One observed-packet-time record inside an ACK (8 bytes): the sequence,
/// the retransmission count of the arrival it reports, and the receiver
/// hold time between that arrival and the ACK's transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedTime {
    pub seq: PktSeq,
    pub rexmit: u8,
    /// Hold time in microseconds; 24-bit field, saturating.
    pub delta_us: u32,
}

const OBSERVED_DELTA_MAX: u32 = 0x00FF_FFFF;

/// One ACK block (2 bytes): a 15-bit offset above the ACK's next-expected
/// sequence. Two consecutive `RangeEnd` blocks delimit a closed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBlock {
    pub kind: AckBlockKind,
    pub offset: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckBlockKind {
    Single = 0,
    RangeEnd = 1,
}

/// ACK header (type 33): base 16 bytes, plus 8 per observed time and 2 per
/// ACK block. Chainable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHdr {
    pub stream_id: u8,
    /// Next expected sequence: everything below it has been received.
    pub ne_seq: PktSeq,
    pub ts: PktTimestamp,
    pub ts_delta: u32,
    pub observed: Vec<ObservedTime>,
    pub blocks: Vec<AckBlock>,
}

pub const ACK_BASE_LEN: usize = 16;
pub const ACK_OBSERVED_LEN: usize = 8;
pub const ACK_BLOCK_LEN: usize = 2;

impl AckHdr {
    pub fn encoded_len(&self) -> usize {
        ACK_BASE_LEN + self.observed.len() * ACK_OBSERVED_LEN + self.blocks.len() * ACK_BLOCK_LEN
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        if self.observed.len() > MAX_OBSERVED_TIMES {
            return Err(FrameError::FieldOverflow("observed time count"));
        }
        if self.blocks.len() > MAX_ACK_BLOCKS {
            return Err(FrameError::FieldOverflow("ack block count"));
        }
        buf.put_u8(ACK_HDR);
        buf.put_u8(0);
        buf.put_u8(self.stream_id);
        buf.put_u8(((self.observed.len() as u8) << 5) | (self.blocks.len() as u8));
        buf.put_u32(self.ne_seq.0);
        buf.put_u32(self.ts.0);
        buf.put_u32(self.ts_delta);
        for obs in &self.observed {
            buf.put_u32(obs.seq.0);
            buf.put_u32(((obs.rexmit as u32) << 24) | obs.delta_us.min(OBSERVED_DELTA_MAX));
        }
        for blk in &self.blocks {
            if blk.offset > 0x7FFF {
                return Err(FrameError::FieldOverflow("ack block offset"));
            }
            buf.put_u16(((blk.kind as u16) << 15) | blk.offset);
        }
        Ok(())
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, FrameError> {
        if buf.remaining() < ACK_BASE_LEN - 1 {
            return Err(FrameError::MalformedFrame);
        }
        let _flags = buf.get_u8();
        let stream_id = buf.get_u8();
        let counts = buf.get_u8();
        let num_times = (counts >> 5) as usize;
        let num_blocks = (counts & 0x1F) as usize;
        let ne_seq = PktSeq(buf.get_u32());
        let ts = PktTimestamp(buf.get_u32());
        let ts_delta = buf.get_u32();
        if buf.remaining() < num_times * ACK_OBSERVED_LEN + num_blocks * ACK_BLOCK_LEN {
            return Err(FrameError::InconsistentCounts);
        }
        let mut observed = Vec::with_capacity(num_times);
        for _ in 0..num_times {
            let seq = PktSeq(buf.get_u32());
            let packed = buf.get_u32();
            observed.push(ObservedTime {
                seq,
                rexmit: (packed >> 24) as u8,
                delta_us: packed & OBSERVED_DELTA_MAX,
            });
        }
        let mut blocks = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            let raw = buf.get_u16();
            blocks.push(AckBlock {
                kind: if raw >> 15 == 1 {
                    AckBlockKind::RangeEnd
                } else {
                    AckBlockKind::Single
                },
                offset: raw & 0x7FFF,
            });
        }
        Ok(AckHdr {
            stream_id,
            ne_seq,
            ts,
            ts_delta,
            observed,
            blocks,
        })
    }

    /// Expand the block list into the acknowledged sequences above `ne_seq`.
    pub fn block_seqs(&self) -> Vec<PktSeq> {
        let mut seqs = Vec::new();
        let mut range_start: Option<PktSeq> = None;
        for blk in &self.blocks {
            let seq = self.ne_seq.add(blk.offset as u32);
            match blk.kind {
                AckBlockKind::Single => {
                    seqs.push(seq);
                    range_start = None;
                }
                AckBlockKind::RangeEnd => match range_start.take() {
                    None => range_start = Some(seq),
                    Some(start) => {
                        let mut s = start;
                        while s <= seq {
                            seqs.push(s);
                            s = s.next();
                        }
                    }
                },
            }
        }
        seqs
    }
}

// ─── CC Sync / Received Packet Count / CC Packet Train ──────────────────────

/// CC Synchronization header (type 34): 8 bytes, chainable. The `params`
/// field is algorithm-specific and relayed without interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcSyncHdr {
    pub cc_id: u8,
    pub seq_num: u16,
    pub params: u32,
}

pub const CC_SYNC_LEN: usize = 8;

impl CcSyncHdr {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(CC_SYNC_HDR);
        buf.put_u8(self.cc_id);
        buf.put_u16(self.seq_num);
        buf.put_u32(self.params);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, FrameError> {
        if buf.remaining() < CC_SYNC_LEN - 1 {
            return Err(FrameError::MalformedFrame);
        }
        Ok(CcSyncHdr {
            cc_id: buf.get_u8(),
            seq_num: buf.get_u16(),
            params: buf.get_u32(),
        })
    }
}

/// Received Packet Count header (type 35): 12 bytes, chainable. Reports the
/// connection-wide count of received data packets alongside the identity of
/// the data packet that triggered it; consecutive reports let the peer
/// estimate the packet error rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcvdPktCntHdr {
    pub stream_id: u8,
    pub rexmit: u8,
    pub seq: PktSeq,
    pub count: u32,
}

pub const RCVD_PKT_CNT_LEN: usize = 12;

impl RcvdPktCntHdr {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(RCVD_PKT_CNT_HDR);
        buf.put_u8(0);
        buf.put_u8(self.stream_id);
        buf.put_u8(self.rexmit);
        buf.put_u32(self.seq.0);
        buf.put_u32(self.count);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, FrameError> {
        if buf.remaining() < RCVD_PKT_CNT_LEN - 1 {
            return Err(FrameError::MalformedFrame);
        }
        let _flags = buf.get_u8();
        Ok(RcvdPktCntHdr {
            stream_id: buf.get_u8(),
            rexmit: buf.get_u8(),
            seq: PktSeq(buf.get_u32()),
            count: buf.get_u32(),
        })
    }
}

/// CC Packet Train header (type 40): 16 bytes plus an opaque probe payload
/// that runs to the end of the datagram. Terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcPktTrainHdr {
    pub cc_id: u8,
    pub pt_type: u8,
    pub pt_seq: u8,
    /// Packet-pair inter-receive time in microseconds.
    pub irt_us: u32,
    pub ts: PktTimestamp,
    pub ts_delta: u32,
    pub payload: Bytes,
}

pub const CC_PKT_TRAIN_BASE_LEN: usize = 16;

impl CcPktTrainHdr {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(CC_PKT_TRAIN_HDR);
        buf.put_u8(self.cc_id);
        buf.put_u8(self.pt_type);
        buf.put_u8(self.pt_seq);
        buf.put_u32(self.irt_us);
        buf.put_u32(self.ts.0);
        buf.put_u32(self.ts_delta);
        buf.extend_from_slice(&self.payload);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, FrameError> {
        if buf.remaining() < CC_PKT_TRAIN_BASE_LEN - 1 {
            return Err(FrameError::MalformedFrame);
        }
        let cc_id = buf.get_u8();
        let pt_type = buf.get_u8();
        let pt_seq = buf.get_u8();
        let irt_us = buf.get_u32();
        let ts = PktTimestamp(buf.get_u32());
        let ts_delta = buf.get_u32();
        let payload = buf.copy_to_bytes(buf.remaining());
        Ok(CcPktTrainHdr {
            cc_id,
            pt_type,
            pt_seq,
            irt_us,
            ts,
            ts_delta,
            payload,
        })
    }
}

// ─── Datagram Composition ───────────────────────────────────────────────────

/// A decoded SLIQ header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliqHeader {
    ConnHandshake(ConnHandshakeHdr),
    ConnReset(ConnResetHdr),
    ConnClose(ConnCloseHdr),
    StreamCreate(StreamCreateHdr),
    StreamReset(StreamResetHdr),
    Data(DataHdr),
    Ack(AckHdr),
    CcSync(CcSyncHdr),
    RcvdPktCnt(RcvdPktCntHdr),
    CcPktTrain(CcPktTrainHdr),
}

impl SliqHeader {
    /// Terminal headers must be last within a datagram.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            SliqHeader::Ack(_) | SliqHeader::CcSync(_) | SliqHeader::RcvdPktCnt(_)
        )
    }

    pub fn type_tag(&self) -> u8 {
        match self {
            SliqHeader::ConnHandshake(_) => CONN_HANDSHAKE_HDR,
            SliqHeader::ConnReset(_) => CONN_RESET_HDR,
            SliqHeader::ConnClose(_) => CONN_CLOSE_HDR,
            SliqHeader::StreamCreate(_) => STREAM_CREATE_HDR,
            SliqHeader::StreamReset(_) => STREAM_RESET_HDR,
            SliqHeader::Data(_) => DATA_HDR,
            SliqHeader::Ack(_) => ACK_HDR,
            SliqHeader::CcSync(_) => CC_SYNC_HDR,
            SliqHeader::RcvdPktCnt(_) => RCVD_PKT_CNT_HDR,
            SliqHeader::CcPktTrain(_) => CC_PKT_TRAIN_HDR,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        match self {
            SliqHeader::ConnHandshake(h) => h.encode(buf)?,
            SliqHeader::ConnReset(h) => h.encode(buf),
            SliqHeader::ConnClose(h) => h.encode(buf),
            SliqHeader::StreamCreate(h) => h.encode(buf)?,
            SliqHeader::StreamReset(h) => h.encode(buf),
            SliqHeader::Data(h) => h.encode(buf)?,
            SliqHeader::Ack(h) => h.encode(buf)?,
            SliqHeader::CcSync(h) => h.encode(buf),
            SliqHeader::RcvdPktCnt(h) => h.encode(buf),
            SliqHeader::CcPktTrain(h) => h.encode(buf),
        }
        Ok(())
    }
}

/// Parse a full UDP payload into its ordered header sequence.
///
/// Chainable headers may repeat; a terminal header, if present, is last and
/// consumes the rest of the datagram.
pub fn parse_datagram(datagram: &[u8]) -> Result<Vec<SliqHeader>, FrameError> {
    let mut buf = Bytes::copy_from_slice(datagram);
    let mut headers = Vec::new();
    while buf.has_remaining() {
        let tag = buf.get_u8();
        match tag {
            CONN_HANDSHAKE_HDR => {
                headers.push(SliqHeader::ConnHandshake(ConnHandshakeHdr::decode(
                    &mut buf,
                )?));
                break;
            }
            CONN_RESET_HDR => {
                headers.push(SliqHeader::ConnReset(ConnResetHdr::decode(&mut buf)?));
                break;
            }
            CONN_CLOSE_HDR => {
                headers.push(SliqHeader::ConnClose(ConnCloseHdr::decode(&mut buf)?));
                break;
            }
            STREAM_CREATE_HDR => {
                headers.push(SliqHeader::StreamCreate(StreamCreateHdr::decode(&mut buf)?));
                break;
            }
            STREAM_RESET_HDR => {
                headers.push(SliqHeader::StreamReset(StreamResetHdr::decode(&mut buf)?));
                break;
            }
            DATA_HDR => {
                headers.push(SliqHeader::Data(DataHdr::decode(&mut buf)?));
                break;
            }
            ACK_HDR => headers.push(SliqHeader::Ack(AckHdr::decode(&mut buf)?)),
            CC_SYNC_HDR => headers.push(SliqHeader::CcSync(CcSyncHdr::decode(&mut buf)?)),
            RCVD_PKT_CNT_HDR => {
                headers.push(SliqHeader::RcvdPktCnt(RcvdPktCntHdr::decode(&mut buf)?))
            }
            CC_PKT_TRAIN_HDR => {
                headers.push(SliqHeader::CcPktTrain(CcPktTrainHdr::decode(&mut buf)?));
                break;
            }
            other => return Err(FrameError::UnknownHeader(other)),
        }
    }
    Ok(headers)
}

/// Emit a header sequence as one UDP payload, enforcing the
/// terminal-header-must-be-last rule.
pub fn emit_datagram(headers: &[SliqHeader]) -> Result<BytesMut, FrameError> {
    let mut buf = BytesMut::with_capacity(64);
    let mut terminal_seen = false;
    for hdr in headers {
        if terminal_seen {
            return Err(FrameError::HeaderAfterTerminal);
        }
        hdr.encode(&mut buf)?;
        terminal_seen = hdr.is_terminal();
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(hdrs: Vec<SliqHeader>) -> Vec<SliqHeader> {
        let buf = emit_datagram(&hdrs).expect("emit");
        parse_datagram(&buf).expect("parse")
    }

    #[test]
    fn handshake_roundtrip() {
        let hdr = ConnHandshakeHdr {
            tag: MsgTag::ClientHello,
            ts: PktTimestamp(123_456),
            echo_ts: PktTimestamp(0),
            cc_algs: vec![
                CcAlgEntry {
                    cc_type: CcType::CubicBytes,
                    deterministic: false,
                    pacing: true,
                    params: 42,
                },
                CcAlgEntry {
                    cc_type: CcType::FixedRate,
                    deterministic: true,
                    pacing: false,
                    params: 5_000_000,
                },
            ],
        };
        let out = roundtrip(vec![SliqHeader::ConnHandshake(hdr.clone())]);
        assert_eq!(out, vec![SliqHeader::ConnHandshake(hdr)]);
    }

    #[test]
    fn handshake_encoded_len_matches() {
        let hdr = ConnHandshakeHdr {
            tag: MsgTag::ServerHello,
            ts: PktTimestamp(1),
            echo_ts: PktTimestamp(2),
            cc_algs: vec![CcAlgEntry {
                cc_type: CcType::NoCc,
                deterministic: false,
                pacing: false,
                params: 0,
            }],
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), hdr.encoded_len());
        assert_eq!(buf.len(), 20);
    }

    #[test]
    fn handshake_bad_entry_count_rejected() {
        // num_cc claims 2 entries but only one is present.
        let mut buf = BytesMut::new();
        ConnHandshakeHdr {
            tag: MsgTag::ClientHello,
            ts: PktTimestamp(0),
            echo_ts: PktTimestamp(0),
            cc_algs: vec![CcAlgEntry {
                cc_type: CcType::TcpCubic,
                deterministic: false,
                pacing: false,
                params: 0,
            }],
        }
        .encode(&mut buf)
        .unwrap();
        buf[1] = 2;
        assert_eq!(parse_datagram(&buf), Err(FrameError::InconsistentCounts));
    }

    #[test]
    fn conn_reset_roundtrip() {
        let hdr = ConnResetHdr {
            error: ConnResetCode::SocketWriteError,
        };
        let out = roundtrip(vec![SliqHeader::ConnReset(hdr)]);
        assert_eq!(out, vec![SliqHeader::ConnReset(hdr)]);
    }

    #[test]
    fn conn_close_roundtrip() {
        let hdr = ConnCloseHdr {
            ack: true,
            reason: CloseReason::FlowControlExcess,
        };
        let out = roundtrip(vec![SliqHeader::ConnClose(hdr)]);
        assert_eq!(out, vec![SliqHeader::ConnClose(hdr)]);
    }

    #[test]
    fn stream_create_roundtrip() {
        let hdr = StreamCreateHdr {
            ack: false,
            auto_tune: true,
            del_time: true,
            stream_id: 2,
            priority: 3,
            init_win_size: 1024,
            init_seq: PktSeq(1000),
            delivery: DeliveryMode::Ordered,
            reliability: ReliabilityMode::SemiReliableArqFec,
            rexmit_limit: 2,
            tgt_delivery: 250,
            tgt_rcv_prob: 9900,
        };
        let out = roundtrip(vec![SliqHeader::StreamCreate(hdr.clone())]);
        assert_eq!(out, vec![SliqHeader::StreamCreate(hdr)]);
    }

    #[test]
    fn stream_create_is_20_bytes() {
        let hdr = StreamCreateHdr {
            ack: true,
            auto_tune: false,
            del_time: false,
            stream_id: 9,
            priority: 0,
            init_win_size: 64,
            init_seq: PktSeq(1),
            delivery: DeliveryMode::Unordered,
            reliability: ReliabilityMode::BestEffort,
            rexmit_limit: 0,
            tgt_delivery: 1,
            tgt_rcv_prob: 9990,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), STREAM_CREATE_LEN);
    }

    #[test]
    fn stream_reset_roundtrip() {
        let hdr = StreamResetHdr {
            stream_id: 5,
            error: StreamErrorCode::TransmitQueueError,
            final_seq: PktSeq(99_999),
        };
        let out = roundtrip(vec![SliqHeader::StreamReset(hdr)]);
        assert_eq!(out, vec![SliqHeader::StreamReset(hdr)]);
    }

    #[test]
    fn data_minimal_roundtrip() {
        let hdr = DataHdr::new(
            2,
            PktSeq(1000),
            PktTimestamp(500_000),
            Bytes::from_static(b"payload bytes"),
        );
        let out = roundtrip(vec![SliqHeader::Data(hdr.clone())]);
        assert_eq!(out, vec![SliqHeader::Data(hdr)]);
    }

    #[test]
    fn data_all_options_roundtrip() {
        let mut hdr = DataHdr::new(7, PktSeq(42), PktTimestamp(1), Bytes::from_static(b"x"));
        hdr.persist = true;
        hdr.fin = true;
        hdr.rexmit = 3;
        hdr.cc_id = 1;
        hdr.ts_delta = 77;
        hdr.move_fwd = Some(PktSeq(40));
        hdr.fec = Some(FecInfo {
            pkt_type: FecPktType::Encoded,
            index: 12,
            num_src: 10,
            round: 2,
            group: 0xBEEF,
        });
        hdr.enc_pkt_len = Some(0x1234);
        hdr.ttgs = vec![
            TimeToGo::from_micros(500_000),
            TimeToGo::from_micros(2_000_000),
        ];
        let out = roundtrip(vec![SliqHeader::Data(hdr.clone())]);
        assert_eq!(out, vec![SliqHeader::Data(hdr)]);
    }

    #[test]
    fn data_base_len_is_20() {
        let hdr = DataHdr::new(1, PktSeq(0), PktTimestamp(0), Bytes::new());
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), DATA_BASE_LEN);
    }

    #[test]
    fn data_payload_length_mismatch_rejected() {
        let hdr = DataHdr::new(1, PktSeq(0), PktTimestamp(0), Bytes::from_static(b"abcd"));
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf).unwrap();
        // Claim a 6-byte payload while only 4 are present.
        buf[7] = 6;
        assert_eq!(parse_datagram(&buf), Err(FrameError::InconsistentCounts));
    }

    #[test]
    fn data_truncated_option_rejected() {
        let mut hdr = DataHdr::new(1, PktSeq(0), PktTimestamp(0), Bytes::new());
        hdr.move_fwd = Some(PktSeq(5));
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf).unwrap();
        let truncated = &buf[..DATA_BASE_LEN + 2];
        assert_eq!(parse_datagram(truncated), Err(FrameError::MalformedFrame));
    }

    #[test]
    fn ttg_split_encoding() {
        // Sub-second values use the fractional form.
        let half = TimeToGo::from_micros(500_000);
        assert_eq!(half.0 & 0x8000, 0);
        let us = half.as_micros();
        assert!((us as i64 - 500_000).unsigned_abs() < 40, "us={us}");

        // Values over one second use the millisecond form.
        let two = TimeToGo::from_micros(2_500_000);
        assert_eq!(two.0 & 0x8000, 0x8000);
        assert_eq!(two.as_micros(), 2_500_000);
    }

    #[test]
    fn ack_roundtrip_with_observed_and_blocks() {
        let hdr = AckHdr {
            stream_id: 2,
            ne_seq: PktSeq(1000),
            ts: PktTimestamp(9_000),
            ts_delta: 150,
            observed: vec![
                ObservedTime {
                    seq: PktSeq(1004),
                    rexmit: 1,
                    delta_us: 220,
                },
                ObservedTime {
                    seq: PktSeq(1003),
                    rexmit: 0,
                    delta_us: 75,
                },
            ],
            blocks: vec![
                AckBlock {
                    kind: AckBlockKind::Single,
                    offset: 3,
                },
                AckBlock {
                    kind: AckBlockKind::RangeEnd,
                    offset: 6,
                },
                AckBlock {
                    kind: AckBlockKind::RangeEnd,
                    offset: 9,
                },
            ],
        };
        let out = roundtrip(vec![SliqHeader::Ack(hdr.clone())]);
        assert_eq!(out, vec![SliqHeader::Ack(hdr)]);
    }

    #[test]
    fn ack_block_seq_expansion() {
        let hdr = AckHdr {
            stream_id: 1,
            ne_seq: PktSeq(100),
            ts: PktTimestamp(0),
            ts_delta: 0,
            observed: vec![],
            blocks: vec![
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
            ],
        };
        let seqs = hdr.block_seqs();
        assert_eq!(seqs, vec![PktSeq(102), PktSeq(105), PktSeq(106), PktSeq(107)]);
    }

    #[test]
    fn ack_observed_delta_saturates() {
        let hdr = AckHdr {
            stream_id: 0,
            ne_seq: PktSeq(0),
            ts: PktTimestamp(0),
            ts_delta: 0,
            observed: vec![ObservedTime {
                seq: PktSeq(1),
                rexmit: 2,
                delta_us: u32::MAX,
            }],
            blocks: vec![],
        };
        let buf = emit_datagram(&[SliqHeader::Ack(hdr)]).unwrap();
        match &parse_datagram(&buf).unwrap()[0] {
            SliqHeader::Ack(a) => {
                assert_eq!(a.observed[0].rexmit, 2);
                assert_eq!(a.observed[0].delta_us, 0x00FF_FFFF);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ack_count_mismatch_rejected() {
        let hdr = AckHdr {
            stream_id: 1,
            ne_seq: PktSeq(10),
            ts: PktTimestamp(0),
            ts_delta: 0,
            observed: vec![],
            blocks: vec![AckBlock {
                kind: AckBlockKind::Single,
                offset: 1,
            }],
        };
        let buf = emit_datagram(&[SliqHeader::Ack(hdr)]).unwrap();
        let truncated = &buf[..buf.len() - 1];
        assert_eq!(
            parse_datagram(truncated),
            Err(FrameError::InconsistentCounts)
        );
    }

    #[test]
    fn cc_sync_roundtrip_and_chaining() {
        let sync = CcSyncHdr {
            cc_id: 1,
            seq_num: 7,
            params: 0xDEAD_BEEF,
        };
        let cnt = RcvdPktCntHdr {
            stream_id: 3,
            rexmit: 0,
            seq: PktSeq(512),
            count: 10_000,
        };
        let ack = AckHdr {
            stream_id: 3,
            ne_seq: PktSeq(512),
            ts: PktTimestamp(1),
            ts_delta: 0,
            observed: vec![],
            blocks: vec![],
        };
        let data = DataHdr::new(3, PktSeq(512), PktTimestamp(2), Bytes::from_static(b"pp"));

        let out = roundtrip(vec![
            SliqHeader::CcSync(sync),
            SliqHeader::Ack(ack.clone()),
            SliqHeader::RcvdPktCnt(cnt),
            SliqHeader::Data(data.clone()),
        ]);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], SliqHeader::CcSync(sync));
        assert_eq!(out[1], SliqHeader::Ack(ack));
        assert_eq!(out[2], SliqHeader::RcvdPktCnt(cnt));
        assert_eq!(out[3], SliqHeader::Data(data));
    }

    #[test]
    fn cc_pkt_train_roundtrip() {
        let hdr = CcPktTrainHdr {
            cc_id: 0,
            pt_type: 1,
            pt_seq: 9,
            irt_us: 1234,
            ts: PktTimestamp(55),
            ts_delta: 66,
            payload: Bytes::from_static(&[0xAA; 32]),
        };
        let out = roundtrip(vec![SliqHeader::CcPktTrain(hdr.clone())]);
        assert_eq!(out, vec![SliqHeader::CcPktTrain(hdr)]);
    }

    #[test]
    fn header_after_terminal_rejected() {
        let data = DataHdr::new(1, PktSeq(0), PktTimestamp(0), Bytes::new());
        let ack = AckHdr {
            stream_id: 1,
            ne_seq: PktSeq(0),
            ts: PktTimestamp(0),
            ts_delta: 0,
            observed: vec![],
            blocks: vec![],
        };
        let err = emit_datagram(&[SliqHeader::Data(data), SliqHeader::Ack(ack)]);
        assert_eq!(err, Err(FrameError::HeaderAfterTerminal));
    }

    #[test]
    fn unknown_header_type_rejected() {
        let buf = [17u8, 0, 0, 0, 0, 0];
        assert_eq!(parse_datagram(&buf), Err(FrameError::UnknownHeader(17)));
    }

    #[test]
    fn truncated_base_header_rejected() {
        let buf = [ACK_HDR, 0, 1];
        assert_eq!(parse_datagram(&buf), Err(FrameError::MalformedFrame));
    }
}
