//! Endpoint counters and small estimation helpers.

use serde::{Deserialize, Serialize};

// ─── Connection Counters ────────────────────────────────────────────────────

/// Counters for one connection endpoint. All monotonic.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConnStats {
    /// Data packets transmitted, including retransmissions and coded FEC.
    pub data_sent: u64,
    /// Retransmissions among `data_sent`.
    pub retransmissions: u64,
    /// FEC coded packets among `data_sent`.
    pub coded_sent: u64,
    /// Data packets received (connection-wide received-packet counter).
    pub data_rcvd: u64,
    /// Duplicate data arrivals dropped.
    pub duplicates_rcvd: u64,
    /// Packets newly acknowledged by the peer.
    pub packets_acked: u64,
    /// Packets abandoned after exhausting a retransmission budget.
    pub packets_abandoned: u64,
    /// Source payloads reconstructed by FEC decoding.
    pub fec_recovered: u64,
    /// Move-forward signals sent.
    pub move_fwd_sent: u64,
    /// Move-forward signals received.
    pub move_fwd_rcvd: u64,
    /// ACK headers sent.
    pub acks_sent: u64,
    /// ACK headers received.
    pub acks_rcvd: u64,
    /// Datagrams dropped by the codec.
    pub malformed_frames: u64,
}

impl ConnStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of transmissions that were retransmissions.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.data_sent == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.data_sent as f64
        }
    }
}

// ─── Loss-Rate Estimation ───────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Ewma { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(v) => self.alpha * sample + (1.0 - self.alpha) * v,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }

    pub fn is_seeded(&self) -> bool {
        self.value.is_some()
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

/// Minimum transmissions between consumed reports; shorter intervals
/// accumulate, keeping single-burst noise out of the estimate.
const LOSS_SAMPLE_MIN_SENT: u64 = 512;

/// Packet-error-rate estimate from the peer's Received Packet Count
/// reports: compares growth of the peer's receive counter against our own
/// send counter between consecutive reports.
#[derive(Debug)]
pub struct LossEstimator {
    last_peer_count: Option<u32>,
    last_sent_count: Option<u64>,
    per: Ewma,
}

impl LossEstimator {
    pub fn new() -> Self {
        LossEstimator {
            last_peer_count: None,
            last_sent_count: None,
            per: Ewma::new(0.25),
        }
    }

    /// Feed one report: the peer has seen `peer_count` data packets total,
    /// while we have transmitted `sent_count`.
    pub fn on_report(&mut self, peer_count: u32, sent_count: u64) {
        let (Some(prev_peer), Some(prev_sent)) = (self.last_peer_count, self.last_sent_count)
        else {
            self.last_peer_count = Some(peer_count);
            self.last_sent_count = Some(sent_count);
            return;
        };
        let delivered = peer_count.wrapping_sub(prev_peer) as u64;
        let sent = sent_count.saturating_sub(prev_sent);
        if sent < LOSS_SAMPLE_MIN_SENT {
            return; // keep accumulating this interval
        }
        if delivered <= sent {
            let loss = (sent - delivered) as f64 / sent as f64;
            self.per.update(loss);
        }
        self.last_peer_count = Some(peer_count);
        self.last_sent_count = Some(sent_count);
    }

    /// Current loss-rate estimate, 0.0 when unseeded.
    pub fn per(&self) -> f64 {
        self.per.value()
    }
}

impl Default for LossEstimator {
    fn default() -> Self {
        Self::new()
    }
}
