//! Smoothed round-trip-time estimation, RFC 6298 constants.

// RTO bounds. The floor keeps timer-driven retransmissions from firing
// inside normal ACK delay; the cap bounds backoff.
const MIN_RTO_US: u64 = 200_000;
const MAX_RTO_US: u64 = 60_000_000;

/// Default RTO before the first sample.
const INITIAL_RTO_US: u64 = 1_000_000;

/// Jacobson/Karels RTT estimator with variance tracking.
///
/// Samples arrive already corrected for receiver hold time (the ACK's
/// observed delta), so they measure pure path round trip.
pub struct RttEstimator {
    srtt_us: f64,
    rttvar_us: f64,
    min_rtt_us: f64,
    max_rtt_us: f64,
    samples: u64,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            srtt_us: 0.0,
            rttvar_us: 0.0,
            min_rtt_us: f64::MAX,
            max_rtt_us: 0.0,
            samples: 0,
        }
    }

    /// Feed one RTT sample in microseconds.
    pub fn on_sample(&mut self, rtt_us: f64) {
        if rtt_us < 0.0 {
            return;
        }
        self.samples += 1;
        self.min_rtt_us = self.min_rtt_us.min(rtt_us);
        self.max_rtt_us = self.max_rtt_us.max(rtt_us);

        if self.samples == 1 {
            self.srtt_us = rtt_us;
            self.rttvar_us = rtt_us / 2.0;
        } else {
            // α = 1/8, β = 1/4
            self.rttvar_us = 0.75 * self.rttvar_us + 0.25 * (self.srtt_us - rtt_us).abs();
            self.srtt_us = 0.875 * self.srtt_us + 0.125 * rtt_us;
        }
    }

    pub fn srtt_us(&self) -> f64 {
        self.srtt_us
    }

    pub fn rttvar_us(&self) -> f64 {
        self.rttvar_us
    }

    pub fn min_rtt_us(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.min_rtt_us
        }
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Retransmission timeout: `srtt + 4·rttvar`, floored and capped.
    pub fn rto_us(&self) -> u64 {
        if self.samples == 0 {
            return INITIAL_RTO_US;
        }
        let rto = self.srtt_us + 4.0 * self.rttvar_us;
        (rto as u64).clamp(MIN_RTO_US, MAX_RTO_US)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_estimator() {
        let mut rtt = RttEstimator::new();
        rtt.on_sample(50_000.0);
        assert_eq!(rtt.srtt_us(), 50_000.0);
        assert_eq!(rtt.rttvar_us(), 25_000.0);
        assert_eq!(rtt.samples(), 1);
    }

    #[test]
    fn converges_to_constant_rtt_within_eight_samples() {
        let mut rtt = RttEstimator::new();
        // Bad initial sample, then a steady 50 ms path.
        rtt.on_sample(120_000.0);
        for _ in 0..7 {
            rtt.on_sample(50_000.0);
        }
        let err = (rtt.srtt_us() - 50_000.0).abs() / 50_000.0;
        assert!(err < 0.05, "srtt={} err={}", rtt.srtt_us(), err);
    }

    #[test]
    fn rto_floor_and_cap() {
        let mut rtt = RttEstimator::new();
        rtt.on_sample(10.0);
        assert_eq!(rtt.rto_us(), MIN_RTO_US);

        let mut slow = RttEstimator::new();
        slow.on_sample(100_000_000.0);
        assert_eq!(slow.rto_us(), MAX_RTO_US);
    }

    #[test]
    fn rto_before_any_sample() {
        let rtt = RttEstimator::new();
        assert_eq!(rtt.rto_us(), INITIAL_RTO_US);
    }

    #[test]
    fn negative_sample_ignored() {
        let mut rtt = RttEstimator::new();
        rtt.on_sample(-5.0);
        assert_eq!(rtt.samples(), 0);
    }

    #[test]
    fn min_max_tracking() {
        let mut rtt = RttEstimator::new();
        rtt.on_sample(40_000.0);
        rtt.on_sample(60_000.0);
        rtt.on_sample(45_000.0);
        assert_eq!(rtt.min_rtt_us(), 40_000.0);
    }
}
