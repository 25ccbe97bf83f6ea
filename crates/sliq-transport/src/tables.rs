//! # Adaptive-Efficiency FEC Lookup Tables
//!
//! Given a packet error rate, a target receive probability, a round budget,
//! and how many source/coded packets of a group the receiver already holds,
//! these tables answer one question: how many degrees of freedom should go
//! on the wire this round.
//!
//! Two tables exist per parameter profile. The **midgame** table drives all
//! but the final round and targets an intermediate per-round receive
//! probability chosen by an efficiency search. The **endgame** table drives
//! the final round against the stream's full target, since any residual
//! miss there is final.
//!
//! When the round budget is at or past the pure-ARQ cutover — the number of
//! ARQ rounds that alone would meet the target — both tables degenerate to
//! plain retransmission counts.
//!
//! The probability model is combination-based: receptions are independent
//! Bernoulli trials at the binned error rate, and a systematic group decodes
//! once any `k` of its distinct degrees of freedom arrive. Table pairs are
//! built on first use per profile and cached for the process lifetime.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Largest FEC group size.
pub const MAX_SRC_PKTS: usize = 10;

/// Largest round budget the tables cover.
pub const MAX_ROUNDS: u8 = 7;

/// Cap on degrees of freedom per round.
pub const MAX_BLOCK_LEN: usize = 40;

/// Packet-error-rate bins. Lookups snap the measured rate *up* to the next
/// bin.
pub const PER_BINS: [f64; 9] = [0.10, 0.15, 0.20, 0.25, 0.30, 0.35, 0.40, 0.45, 0.50];

/// Epsilon (1 - target receive probability) bins. Lookups snap the target
/// *down* to the nearest representable value.
pub const EPSILON_BINS: [f64; 14] = [
    0.001, 0.002, 0.003, 0.004, 0.005, 0.010, 0.015, 0.020, 0.025, 0.030, 0.035, 0.040, 0.045,
    0.050,
];

// Width of the coded axis in the state tables: coded receptions can
// overshoot k by at most one round's block.
const CODED_DIM: usize = MAX_SRC_PKTS + MAX_BLOCK_LEN + 1;

// Midgame target candidates swept by the efficiency search. Zero selects an
// ARQ-like midgame.
const MIDGAME_CANDIDATES: [f64; 51] = [
    0.0, 0.01, 0.02, 0.04, 0.06, 0.08, 0.10, 0.12, 0.14, 0.16, 0.18, 0.20, 0.22, 0.24, 0.26,
    0.28, 0.30, 0.32, 0.34, 0.36, 0.38, 0.40, 0.42, 0.44, 0.46, 0.48, 0.50, 0.52, 0.54, 0.56,
    0.58, 0.60, 0.62, 0.64, 0.66, 0.68, 0.70, 0.72, 0.74, 0.76, 0.78, 0.80, 0.82, 0.84, 0.86,
    0.88, 0.90, 0.92, 0.94, 0.96, 0.98,
];

// ─── Profile Snapping ───────────────────────────────────────────────────────

/// A fully binned table address: one (k, per, rounds, epsilon) combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FecProfile {
    pub k: u8,
    pub per_idx: u8,
    pub rounds: u8,
    pub eps_idx: u8,
}

impl FecProfile {
    /// Snap raw parameters onto the table grid: error rate up, target down,
    /// group size and rounds clamped to the supported ranges.
    pub fn snap(per: f64, tgt_precv: f64, rounds: u8, k: usize) -> Self {
        let per_idx = PER_BINS
            .iter()
            .position(|&b| b >= per)
            .unwrap_or(PER_BINS.len() - 1);
        let eps_idx = EPSILON_BINS
            .iter()
            .position(|&e| tgt_precv >= 1.0 - e)
            .unwrap_or(EPSILON_BINS.len() - 1);
        FecProfile {
            k: k.clamp(1, MAX_SRC_PKTS) as u8,
            per_idx: per_idx as u8,
            rounds: rounds.clamp(1, MAX_ROUNDS),
            eps_idx: eps_idx as u8,
        }
    }

    pub fn per(&self) -> f64 {
        PER_BINS[self.per_idx as usize]
    }

    pub fn tgt_precv(&self) -> f64 {
        1.0 - EPSILON_BINS[self.eps_idx as usize]
    }
}

/// Rounds of pure ARQ that already meet the target at this loss rate.
pub fn arq_cutover(per: f64, tgt_precv: f64) -> u8 {
    let mut cutover = 1u8;
    let mut ploss = per;
    while ploss > (1.0 - tgt_precv) && cutover < u8::MAX {
        ploss *= per;
        cutover += 1;
    }
    cutover
}

// ─── Probability Model ──────────────────────────────────────────────────────

fn combin(n: usize, m: usize) -> f64 {
    if m > n {
        return 0.0;
    }
    let m = m.min(n - m);
    let mut acc = 1.0f64;
    for i in 0..m {
        acc = acc * (n - i) as f64 / (i + 1) as f64;
    }
    acc
}

/// Binomial(n, p) probability mass for 0..=n successes.
fn binom_pmf(n: usize, p: f64) -> Vec<f64> {
    (0..=n)
        .map(|i| combin(n, i) * p.powi(i as i32) * (1.0 - p).powi((n - i) as i32))
        .collect()
}

/// Probability that a group in state (`src_rcvd`, `coded_rcvd`) becomes
/// decodable after `dof_to_send` more transmissions, with every degree of
/// freedom interchangeable.
pub fn conditional_simple_ps(
    k: usize,
    src_rcvd: usize,
    coded_rcvd: usize,
    dof_to_send: usize,
    per: f64,
) -> f64 {
    let have = src_rcvd + coded_rcvd;
    if have >= k {
        return 1.0;
    }
    let need = k - have;
    let pmf = binom_pmf(dof_to_send, 1.0 - per);
    pmf.iter().skip(need).sum()
}

/// Expected usable-packet fraction for a systematic group in state
/// (`src_rcvd`, `coded_rcvd`) after `dof_to_send` more transmissions, with
/// missing source packets resent before fresh coded packets. Directly
/// received source packets stay usable even when the group never decodes.
pub fn conditional_systematic_ps(
    k: usize,
    src_rcvd: usize,
    coded_rcvd: usize,
    dof_to_send: usize,
    per: f64,
) -> f64 {
    if src_rcvd >= k {
        return 1.0;
    }
    if src_rcvd + coded_rcvd >= k {
        return 1.0;
    }
    let src_to_send = dof_to_send.min(k - src_rcvd);
    let fec_to_send = dof_to_send - src_to_send;
    let q = 1.0 - per;
    let pmf_s = binom_pmf(src_to_send, q);
    let pmf_f = binom_pmf(fec_to_send, q);

    let mut usable = 0.0;
    for (i, ps) in pmf_s.iter().enumerate() {
        for (j, pf) in pmf_f.iter().enumerate() {
            let mass = ps * pf;
            if src_rcvd + coded_rcvd + i + j >= k {
                usable += mass * k as f64;
            } else {
                usable += mass * (src_rcvd + i) as f64;
            }
        }
    }
    usable / k as f64
}

/// Smallest dof meeting `tgt_precv` under the interchangeable-DoF model,
/// capped at `max_block`.
fn simple_dof_to_send(
    max_block: usize,
    per: f64,
    tgt_precv: f64,
    k: usize,
    src_rcvd: usize,
    coded_rcvd: usize,
) -> usize {
    let need = k.saturating_sub(src_rcvd + coded_rcvd).max(1);
    for dof in need..=max_block {
        if conditional_simple_ps(k, src_rcvd, coded_rcvd, dof, per) >= tgt_precv {
            return dof;
        }
    }
    max_block
}

/// Smallest dof meeting `tgt_precv` under the systematic partial-credit
/// model, capped at `max_block`.
fn systematic_dof_to_send(
    max_block: usize,
    per: f64,
    tgt_precv: f64,
    k: usize,
    src_rcvd: usize,
    coded_rcvd: usize,
) -> usize {
    let need = k.saturating_sub(src_rcvd + coded_rcvd).max(1);
    for dof in need..=max_block {
        if conditional_systematic_ps(k, src_rcvd, coded_rcvd, dof, per) >= tgt_precv {
            return dof;
        }
    }
    max_block
}

// ─── Table Pair ─────────────────────────────────────────────────────────────

/// The midgame/endgame dof tables for one parameter profile, indexed by
/// (source received, coded received) over the live states of a k-group.
pub struct DofTablePair {
    k: usize,
    rounds: u8,
    midgame: Vec<Vec<u8>>,
    endgame: Vec<Vec<u8>>,
}

impl DofTablePair {
    /// Degrees of freedom to transmit for the given group state and round
    /// (1-based). Zero once the group is already decodable.
    pub fn dof_to_send(&self, src_rcvd: usize, coded_rcvd: usize, round: u8) -> u8 {
        if src_rcvd + coded_rcvd >= self.k || src_rcvd >= self.k {
            return 0;
        }
        let table = if round >= self.rounds {
            &self.endgame
        } else {
            &self.midgame
        };
        table[src_rcvd][coded_rcvd]
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn rounds(&self) -> u8 {
        self.rounds
    }

    fn arq_like(k: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|n| vec![(k - n) as u8; k - n])
            .collect()
    }

    fn from_simple(k: usize, per: f64, tgt: f64) -> Vec<Vec<u8>> {
        (0..k)
            .map(|n| {
                (0..k - n)
                    .map(|c| simple_dof_to_send(MAX_BLOCK_LEN, per, tgt, k, n, c) as u8)
                    .collect()
            })
            .collect()
    }

    fn from_systematic(k: usize, per: f64, tgt: f64) -> Vec<Vec<u8>> {
        (0..k)
            .map(|n| {
                (0..k - n)
                    .map(|c| systematic_dof_to_send(MAX_BLOCK_LEN, per, tgt, k, n, c) as u8)
                    .collect()
            })
            .collect()
    }

    /// Build the table pair for one profile.
    fn build(profile: FecProfile) -> Self {
        let k = profile.k as usize;
        let per = profile.per();
        let tgt = profile.tgt_precv();
        let rounds = profile.rounds;

        if rounds >= arq_cutover(per, tgt) {
            // ARQ alone meets the target inside the round budget.
            return DofTablePair {
                k,
                rounds,
                midgame: Self::arq_like(k),
                endgame: Self::arq_like(k),
            };
        }

        let endgame = Self::from_systematic(k, per, tgt);
        if rounds == 1 {
            // Pure FEC: only the endgame table is ever consulted.
            return DofTablePair {
                k,
                rounds,
                midgame: endgame.clone(),
                endgame,
            };
        }

        // Sweep midgame target candidates for the most efficient schedule
        // that still finishes with the endgame table.
        let mut best_eff = -1.0;
        let mut best_mid = Self::arq_like(k);
        for &cand in MIDGAME_CANDIDATES.iter() {
            let mid = if cand < 0.001 {
                Self::arq_like(k)
            } else {
                Self::from_simple(k, per, cand)
            };
            let eff = schedule_efficiency(k, per, rounds, &mid, &endgame);
            if eff > best_eff {
                best_eff = eff;
                best_mid = mid;
            }
        }

        DofTablePair {
            k,
            rounds,
            midgame: best_mid,
            endgame,
        }
    }
}

/// Evolve the group-state distribution one round under a dof table.
/// Returns the probability mass that became decodable this round.
fn propagate_probabilities(
    prev: &[Vec<f64>],
    lut: &[Vec<u8>],
    next: &mut [Vec<f64>],
    per: f64,
    k: usize,
) -> f64 {
    for row in next.iter_mut() {
        row.iter_mut().for_each(|v| *v = 0.0);
    }

    let q = 1.0 - per;
    let mut newly_decodable = 0.0;
    for n in 0..=k {
        for c in 0..CODED_DIM {
            let mass = prev[n][c];
            if mass == 0.0 {
                continue;
            }
            if n + c >= k {
                // Terminal: already decodable, nothing more is sent.
                next[n][c] += mass;
                continue;
            }
            let dof = lut[n][c] as usize;
            let src_to_send = dof.min(k - n);
            let fec_to_send = dof - src_to_send;
            let pmf_s = binom_pmf(src_to_send, q);
            let pmf_f = binom_pmf(fec_to_send, q);
            for (i, ps) in pmf_s.iter().enumerate() {
                for (j, pf) in pmf_f.iter().enumerate() {
                    let m = mass * ps * pf;
                    if m == 0.0 {
                        continue;
                    }
                    next[n + i][c + j] += m;
                    if n + i + c + j >= k {
                        newly_decodable += m;
                    }
                }
            }
        }
    }
    newly_decodable
}

/// Expected usable packets per transmitted packet for a full schedule.
fn schedule_efficiency(
    k: usize,
    per: f64,
    rounds: u8,
    midgame: &[Vec<u8>],
    endgame: &[Vec<u8>],
) -> f64 {
    let mut state = vec![vec![0.0f64; CODED_DIM]; k + 1];
    let mut next = vec![vec![0.0f64; CODED_DIM]; k + 1];
    state[0][0] = 1.0;

    let mut expected_sent = 0.0;
    for round in 1..=rounds {
        let lut = if round == rounds { endgame } else { midgame };
        for n in 0..k {
            for c in 0..(k - n) {
                if state[n][c] > 0.0 {
                    expected_sent += state[n][c] * lut[n][c] as f64;
                }
            }
        }
        propagate_probabilities(&state, lut, &mut next, per, k);
        std::mem::swap(&mut state, &mut next);
    }

    let mut usable = 0.0;
    for n in 0..=k {
        for c in 0..CODED_DIM {
            let mass = state[n][c];
            if mass == 0.0 {
                continue;
            }
            if n + c >= k {
                usable += mass * k as f64;
            } else {
                usable += mass * n as f64;
            }
        }
    }
    if expected_sent == 0.0 {
        return 0.0;
    }
    usable / expected_sent
}

// ─── Process-Wide Cache ─────────────────────────────────────────────────────

static TABLE_CACHE: Lazy<Mutex<HashMap<FecProfile, Arc<DofTablePair>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Fetch the table pair for the given raw parameters, building it on first
/// use. The returned handle is shared and immutable.
pub fn dof_tables(per: f64, tgt_precv: f64, rounds: u8, k: usize) -> Arc<DofTablePair> {
    let profile = FecProfile::snap(per, tgt_precv, rounds, k);
    let mut cache = TABLE_CACHE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    cache
        .entry(profile)
        .or_insert_with(|| Arc::new(DofTablePair::build(profile)))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn profile_snaps_per_up_and_target_down() {
        let p = FecProfile::snap(0.17, 0.9965, 3, 8);
        assert_eq!(p.per(), 0.20);
        // 0.9965 is between 1-0.003 (0.997) and 1-0.004 (0.996): snap down.
        assert_eq!(p.eps_idx, 3);
        assert!((p.tgt_precv() - 0.996).abs() < 1e-12);
    }

    #[test]
    fn profile_clamps_out_of_range() {
        let p = FecProfile::snap(0.9, 0.5, 12, 30);
        assert_eq!(p.per(), 0.50);
        assert_eq!(p.rounds, MAX_ROUNDS);
        assert_eq!(p.k as usize, MAX_SRC_PKTS);
    }

    #[test]
    fn arq_cutover_matches_log_formula() {
        // ceil(log(1-tgt)/log(per)): per=0.1, tgt=0.95 → ceil(1.30) = 2.
        assert_eq!(arq_cutover(0.1, 0.95), 2);
        // per=0.2, tgt=0.99 → ceil(log(0.01)/log(0.2)) = ceil(2.86) = 3.
        assert_eq!(arq_cutover(0.2, 0.99), 3);
        // per=0.5, tgt=0.999 → ceil(9.97) = 10.
        assert_eq!(arq_cutover(0.5, 0.999), 10);
    }

    #[test]
    fn combin_small_values() {
        assert_eq!(combin(5, 0), 1.0);
        assert_eq!(combin(5, 2), 10.0);
        assert_eq!(combin(10, 5), 252.0);
        assert_eq!(combin(3, 5), 0.0);
    }

    #[test]
    fn binom_pmf_sums_to_one() {
        let pmf = binom_pmf(20, 0.3);
        let total: f64 = pmf.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn simple_ps_monotone_in_dof() {
        let mut last = 0.0;
        for dof in 5..20 {
            let ps = conditional_simple_ps(5, 0, 0, dof, 0.2);
            assert!(ps >= last);
            last = ps;
        }
        assert!(last > 0.99);
    }

    #[test]
    fn systematic_ps_counts_partial_credit() {
        // With nothing received and one packet sent out of k=2, decode is
        // impossible but the direct source still counts.
        let ps = conditional_systematic_ps(2, 0, 0, 1, 0.2);
        assert!(ps > 0.0 && ps < 1.0);
        let simple = conditional_simple_ps(2, 0, 0, 1, 0.2);
        assert_eq!(simple, 0.0);
    }

    #[test]
    fn degenerate_arq_tables_when_cutover_met() {
        // per=0.10, eps=0.05 → cutover 2; 2 rounds of ARQ suffice.
        let tables = dof_tables(0.10, 0.95, 2, 6);
        for n in 0..6usize {
            for c in 0..(6 - n) {
                assert_eq!(tables.dof_to_send(n, c, 1) as usize, 6 - n);
                assert_eq!(tables.dof_to_send(n, c, 2) as usize, 6 - n);
            }
        }
    }

    #[test]
    fn pure_fec_first_round_dof() {
        // Spec scenario parameters: k=10, per=0.20, N=1, tgt=0.99.
        let tables = dof_tables(0.20, 0.99, 1, 10);
        let dof = tables.dof_to_send(0, 0, 1);
        assert!(dof >= 12, "pure-FEC dof {dof} too small for 20% loss");
        assert!(dof as usize <= MAX_BLOCK_LEN);
    }

    #[test]
    fn decodable_state_needs_nothing() {
        let tables = dof_tables(0.20, 0.99, 1, 10);
        assert_eq!(tables.dof_to_send(10, 0, 1), 0);
        assert_eq!(tables.dof_to_send(4, 6, 1), 0);
    }

    #[test]
    fn later_round_dof_shrinks_with_progress() {
        let tables = dof_tables(0.20, 0.99, 2, 10);
        let fresh = tables.dof_to_send(0, 0, 2);
        let nearly = tables.dof_to_send(9, 0, 2);
        assert!(fresh > nearly);
        assert!(nearly >= 1);
    }

    #[test]
    fn cache_returns_shared_handle() {
        let a = dof_tables(0.20, 0.99, 1, 10);
        let b = dof_tables(0.20, 0.99, 1, 10);
        assert!(Arc::ptr_eq(&a, &b));
    }

    /// Drive the table through its own schedule under simulated independent
    /// loss and check the delivered-packet probability meets the target.
    fn monte_carlo_precv(k: usize, per: f64, tgt: f64, rounds: u8, trials: u32, seed: u64) -> f64 {
        let tables = dof_tables(per, tgt, rounds, k);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut usable_total = 0u64;
        for _ in 0..trials {
            let mut src = 0usize;
            let mut coded = 0usize;
            for round in 1..=rounds {
                if src + coded >= k {
                    break;
                }
                let dof = tables.dof_to_send(src, coded, round) as usize;
                let src_to_send = dof.min(k - src);
                let fec_to_send = dof - src_to_send;
                for _ in 0..src_to_send {
                    if rng.gen::<f64>() > per {
                        src += 1;
                    }
                }
                for _ in 0..fec_to_send {
                    if rng.gen::<f64>() > per {
                        coded += 1;
                    }
                }
            }
            usable_total += if src + coded >= k { k as u64 } else { src as u64 };
        }
        usable_total as f64 / (trials as u64 * k as u64) as f64
    }

    #[test]
    fn monte_carlo_pure_fec_meets_target() {
        let precv = monte_carlo_precv(10, 0.20, 0.99, 1, 200_000, 0x5EED);
        // Three-sigma statistical slack on 200k trials.
        assert!(precv >= 0.99 - 0.001, "empirical receive probability {precv}");
    }

    #[test]
    fn monte_carlo_two_round_meets_target() {
        let precv = monte_carlo_precv(5, 0.30, 0.98, 2, 100_000, 0xFEC);
        // Allow three-sigma statistical slack on 100k trials.
        assert!(precv >= 0.98 - 0.002, "empirical receive probability {precv}");
    }

    #[test]
    fn monte_carlo_small_group_high_loss() {
        let precv = monte_carlo_precv(4, 0.50, 0.95, 2, 100_000, 0xABCD);
        assert!(precv >= 0.95 - 0.003, "empirical receive probability {precv}");
    }
}
