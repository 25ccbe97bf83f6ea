//! # Congestion-Control Adapter
//!
//! The core never implements congestion control beyond a fixed-rate pacer;
//! real algorithms plug in behind one narrow trait. The adapter owns the
//! negotiated algorithm set (up to 16 per direction), routes per-packet
//! events to the governing algorithm, relays CC Sync and CC Packet Train
//! headers verbatim, and falls back to conservative fixed pacing when an
//! algorithm misbehaves.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::seq::{PktSeq, PktTimestamp};
use crate::wire::{CcAlgEntry, CcPktTrainHdr, CcSyncHdr, CcType};

// ─── Event Records ──────────────────────────────────────────────────────────

/// What the core tells the algorithm about every data transmission.
#[derive(Debug, Clone, Copy)]
pub struct SendInfo {
    pub stream_id: u8,
    pub seq: PktSeq,
    pub bytes: usize,
    pub rexmit: u8,
    pub now: PktTimestamp,
}

/// What the core tells the algorithm about every acknowledged packet.
#[derive(Debug, Clone, Copy)]
pub struct AckInfo {
    pub stream_id: u8,
    pub seq: PktSeq,
    pub now: PktTimestamp,
    /// Inferred round-trip time, when this ACK produced a sample.
    pub rtt_us: Option<f64>,
}

// ─── Algorithm Interface ────────────────────────────────────────────────────

/// The narrow interface every congestion-control algorithm implements.
pub trait CongestionControl: Send {
    fn on_data_sent(&mut self, info: &SendInfo);
    fn on_ack(&mut self, info: &AckInfo);
    /// May `bytes` more go on the wire right now?
    fn can_send(&mut self, now: PktTimestamp, bytes: usize) -> bool;
    /// Inter-packet pacing gap for a packet of `bytes`.
    fn pacing_interval_us(&self, bytes: usize) -> u64;
    /// Algorithm-specific state from the peer; never interpreted here.
    fn on_sync(&mut self, hdr: &CcSyncHdr);
    /// Bandwidth-probe train from the peer; never interpreted here.
    fn on_pkt_train(&mut self, hdr: &CcPktTrainHdr);
}

// ─── Built-In Algorithms ────────────────────────────────────────────────────

/// Unlimited sender: no window, no pacing. Covers the `NoCc` slot and any
/// externally owned algorithm that has not been plugged in.
#[derive(Debug, Default)]
pub struct UnlimitedCc;

impl CongestionControl for UnlimitedCc {
    fn on_data_sent(&mut self, _info: &SendInfo) {}
    fn on_ack(&mut self, _info: &AckInfo) {}
    fn can_send(&mut self, _now: PktTimestamp, _bytes: usize) -> bool {
        true
    }
    fn pacing_interval_us(&self, _bytes: usize) -> u64 {
        0
    }
    fn on_sync(&mut self, _hdr: &CcSyncHdr) {}
    fn on_pkt_train(&mut self, _hdr: &CcPktTrainHdr) {}
}

/// Configuration for the fixed-rate pacer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FixedRateConfig {
    /// Send rate in kilobits per second; zero means unlimited.
    pub rate_kbps: u32,
    /// Burst allowance in bytes.
    pub bucket_bytes: u32,
}

impl Default for FixedRateConfig {
    fn default() -> Self {
        FixedRateConfig {
            rate_kbps: 1_000,
            bucket_bytes: 16 * 1024,
        }
    }
}

/// Token-bucket fixed-rate sender. Also the conservative fallback when a
/// pluggable algorithm errors out.
#[derive(Debug)]
pub struct FixedRateCc {
    config: FixedRateConfig,
    tokens: f64,
    last_refill: Option<PktTimestamp>,
}

impl FixedRateCc {
    pub fn new(config: FixedRateConfig) -> Self {
        FixedRateCc {
            tokens: config.bucket_bytes as f64,
            config,
            last_refill: None,
        }
    }

    fn refill(&mut self, now: PktTimestamp) {
        let Some(last) = self.last_refill else {
            self.last_refill = Some(now);
            return;
        };
        let elapsed_us = now.micros_since(last) as f64;
        let bytes_per_us = self.config.rate_kbps as f64 * 1000.0 / 8.0 / 1_000_000.0;
        self.tokens =
            (self.tokens + elapsed_us * bytes_per_us).min(self.config.bucket_bytes as f64);
        self.last_refill = Some(now);
    }
}

impl CongestionControl for FixedRateCc {
    fn on_data_sent(&mut self, info: &SendInfo) {
        if self.config.rate_kbps > 0 {
            self.tokens -= info.bytes as f64;
        }
    }

    fn on_ack(&mut self, _info: &AckInfo) {}

    fn can_send(&mut self, now: PktTimestamp, bytes: usize) -> bool {
        if self.config.rate_kbps == 0 {
            return true;
        }
        self.refill(now);
        self.tokens >= bytes as f64
    }

    fn pacing_interval_us(&self, bytes: usize) -> u64 {
        if self.config.rate_kbps == 0 {
            return 0;
        }
        (bytes as u64 * 8 * 1000) / self.config.rate_kbps as u64
    }

    fn on_sync(&mut self, _hdr: &CcSyncHdr) {}
    fn on_pkt_train(&mut self, _hdr: &CcPktTrainHdr) {}
}

// ─── Adapter ────────────────────────────────────────────────────────────────

struct CcSlot {
    entry: CcAlgEntry,
    algo: Box<dyn CongestionControl>,
}

/// Facade between the connection and its negotiated algorithm set. Data
/// packets carry the `cc_id` of the slot that governed them.
pub struct CcAdapter {
    slots: Vec<CcSlot>,
    /// Slot governing new transmissions.
    active: usize,
    /// Outbound algorithm-state headers awaiting a datagram.
    sync_outbox: Vec<CcSyncHdr>,
}

impl CcAdapter {
    /// Build slots for a negotiated entry list. `FixedRate` and `NoCc` get
    /// their built-in implementations; other types start as unlimited
    /// placeholders until [`CcAdapter::plug`] installs the external
    /// algorithm.
    pub fn new(entries: &[CcAlgEntry]) -> Self {
        let slots = entries
            .iter()
            .map(|&entry| CcSlot {
                entry,
                algo: Self::builtin_for(&entry),
            })
            .collect::<Vec<_>>();
        CcAdapter {
            slots,
            active: 0,
            sync_outbox: Vec::new(),
        }
    }

    fn builtin_for(entry: &CcAlgEntry) -> Box<dyn CongestionControl> {
        match entry.cc_type {
            CcType::FixedRate => Box::new(FixedRateCc::new(FixedRateConfig {
                rate_kbps: entry.params,
                bucket_bytes: 16 * 1024,
            })),
            _ => Box::new(UnlimitedCc),
        }
    }

    /// Install an externally implemented algorithm into slot `cc_id`.
    pub fn plug(&mut self, cc_id: u8, algo: Box<dyn CongestionControl>) {
        if let Some(slot) = self.slots.get_mut(cc_id as usize) {
            slot.algo = algo;
        }
    }

    /// Replace a misbehaving algorithm with conservative fixed pacing.
    pub fn fall_back_to_fixed(&mut self, cc_id: u8) {
        if let Some(slot) = self.slots.get_mut(cc_id as usize) {
            warn!(cc_id, "congestion control error, falling back to fixed pacing");
            slot.algo = Box::new(FixedRateCc::new(FixedRateConfig::default()));
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn entry(&self, cc_id: u8) -> Option<&CcAlgEntry> {
        self.slots.get(cc_id as usize).map(|s| &s.entry)
    }

    /// Slot id stamped into outbound Data headers.
    pub fn active_id(&self) -> u8 {
        self.active as u8
    }

    pub fn set_active(&mut self, cc_id: u8) {
        if (cc_id as usize) < self.slots.len() {
            self.active = cc_id as usize;
        }
    }

    pub fn can_send(&mut self, now: PktTimestamp, bytes: usize) -> bool {
        match self.slots.get_mut(self.active) {
            Some(slot) => slot.algo.can_send(now, bytes),
            None => true,
        }
    }

    pub fn pacing_interval_us(&self, bytes: usize) -> u64 {
        self.slots
            .get(self.active)
            .map_or(0, |s| s.algo.pacing_interval_us(bytes))
    }

    pub fn on_data_sent(&mut self, info: &SendInfo) {
        if let Some(slot) = self.slots.get_mut(self.active) {
            slot.algo.on_data_sent(info);
        }
    }

    /// Route an ACK event to the slot that governed the packet.
    pub fn on_ack(&mut self, cc_id: u8, info: &AckInfo) {
        if let Some(slot) = self.slots.get_mut(cc_id as usize) {
            slot.algo.on_ack(info);
        }
    }

    /// Relay an inbound CC Sync to its algorithm, verbatim.
    pub fn on_sync(&mut self, hdr: &CcSyncHdr) {
        if let Some(slot) = self.slots.get_mut(hdr.cc_id as usize) {
            slot.algo.on_sync(hdr);
        }
    }

    /// Relay an inbound packet train to its algorithm, verbatim.
    pub fn on_pkt_train(&mut self, hdr: &CcPktTrainHdr) {
        if let Some(slot) = self.slots.get_mut(hdr.cc_id as usize) {
            slot.algo.on_pkt_train(hdr);
        }
    }

    /// Queue algorithm state for the next outbound datagram.
    pub fn queue_sync(&mut self, hdr: CcSyncHdr) {
        self.sync_outbox.push(hdr);
    }

    pub fn take_syncs(&mut self) -> Vec<CcSyncHdr> {
        std::mem::take(&mut self.sync_outbox)
    }
}
