//! # Systematic Vandermonde FEC over GF(2^8)
//!
//! Coded packets are deterministic linear combinations of a group's source
//! packets. The generator matrix starts as a Vandermonde matrix (any k rows
//! independent) and is right-multiplied by the inverse of its top k×k block,
//! leaving the first k rows as the identity: source packets go out verbatim,
//! and any k distinct degrees of freedom reconstruct the group.
//!
//! Source payload lengths vary, so each source vector is its 16-bit length
//! followed by its payload zero-padded to the group maximum. The combined
//! length bytes travel in the Data header's encoded-packet-length field and
//! are solved alongside the payload bytes on recovery.

use bytes::Bytes;

/// Upper bound on degrees-of-freedom indices (6-bit wire field).
pub const MAX_DOF_INDEX: usize = 64;

// ─── GF(256) Arithmetic ─────────────────────────────────────────────────────

/// GF(2^8) with primitive polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11D).
/// Log/antilog tables for O(1) multiply/divide.
pub(crate) mod gf256 {
    /// Multiplication in GF(256).
    pub fn mul(a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        let log_a = LOG_TABLE[a as usize] as u16;
        let log_b = LOG_TABLE[b as usize] as u16;
        EXP_TABLE[((log_a + log_b) % 255) as usize]
    }

    /// Multiplicative inverse in GF(256). Panics on zero.
    pub fn inv(a: u8) -> u8 {
        assert_ne!(a, 0, "inverse of zero in GF(256)");
        let log_a = LOG_TABLE[a as usize] as u16;
        EXP_TABLE[(255 - log_a) as usize]
    }

    /// `base` raised to `exp` in GF(256).
    pub fn pow(base: u8, exp: usize) -> u8 {
        if exp == 0 {
            return 1;
        }
        if base == 0 {
            return 0;
        }
        let log_b = LOG_TABLE[base as usize] as usize;
        EXP_TABLE[(log_b * exp) % 255]
    }

    // Generate both tables together. Primitive polynomial 0x11D, generator 2.
    const fn gen_tables() -> ([u8; 256], [u8; 512]) {
        let mut log = [0u8; 256];
        let mut exp = [0u8; 512];
        let mut x: u16 = 1;
        let mut i = 0usize;
        while i < 255 {
            exp[i] = x as u8;
            exp[i + 255] = x as u8; // duplicate for easy modular lookup
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= 0x11D;
            }
            i += 1;
        }
        // log[0] is unused (0 has no logarithm)
        log[0] = 0;
        (log, exp)
    }

    const TABLES: ([u8; 256], [u8; 512]) = gen_tables();
    const LOG_TABLE: [u8; 256] = TABLES.0;
    const EXP_TABLE: [u8; 512] = TABLES.1;
}

// ─── Generator Matrix ───────────────────────────────────────────────────────

/// Invert a k×k matrix over GF(256) by Gauss-Jordan elimination.
/// `None` when singular.
fn invert(matrix: &[Vec<u8>]) -> Option<Vec<Vec<u8>>> {
    let k = matrix.len();
    let mut work: Vec<Vec<u8>> = matrix.to_vec();
    let mut inv: Vec<Vec<u8>> = (0..k)
        .map(|i| (0..k).map(|j| u8::from(i == j)).collect())
        .collect();

    for col in 0..k {
        let pivot = (col..k).find(|&r| work[r][col] != 0)?;
        work.swap(col, pivot);
        inv.swap(col, pivot);

        let scale = gf256::inv(work[col][col]);
        for j in 0..k {
            work[col][j] = gf256::mul(work[col][j], scale);
            inv[col][j] = gf256::mul(inv[col][j], scale);
        }
        for row in 0..k {
            if row == col || work[row][col] == 0 {
                continue;
            }
            let factor = work[row][col];
            for j in 0..k {
                work[row][j] ^= gf256::mul(factor, work[col][j]);
                inv[row][j] ^= gf256::mul(factor, inv[col][j]);
            }
        }
    }
    Some(inv)
}

/// Systematic generator for a k-source group: row i is the coefficient
/// vector of degree-of-freedom index i. Rows 0..k are the identity.
pub struct CodingMatrix {
    k: usize,
    rows: Vec<Vec<u8>>,
}

impl CodingMatrix {
    pub fn new(k: usize) -> Self {
        assert!(k >= 1 && k <= MAX_DOF_INDEX);
        // Vandermonde rows over distinct points 0..MAX_DOF_INDEX.
        let vander: Vec<Vec<u8>> = (0..MAX_DOF_INDEX)
            .map(|i| (0..k).map(|j| gf256::pow(i as u8, j)).collect())
            .collect();
        let top_inv = invert(&vander[..k]).expect("vandermonde block is invertible");

        let rows = vander
            .iter()
            .map(|row| {
                (0..k)
                    .map(|j| {
                        let mut acc = 0u8;
                        for (l, &v) in row.iter().enumerate() {
                            acc ^= gf256::mul(v, top_inv[l][j]);
                        }
                        acc
                    })
                    .collect()
            })
            .collect();
        CodingMatrix { k, rows }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Coefficient row for a coded degree-of-freedom index (`k <= idx < 64`).
    pub fn coded_row(&self, idx: usize) -> &[u8] {
        &self.rows[idx]
    }
}

// ─── Encoding ───────────────────────────────────────────────────────────────

/// A coded packet body: the GF-combined length word and the combined
/// payload, padded to the longest source in the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedPayload {
    pub enc_len: u16,
    pub data: Vec<u8>,
}

/// Combine the group's source payloads into the coded packet at
/// degree-of-freedom index `idx`.
pub fn encode_coded(matrix: &CodingMatrix, sources: &[Bytes], idx: usize) -> CodedPayload {
    debug_assert_eq!(sources.len(), matrix.k());
    let coeffs = matrix.coded_row(idx);
    let max_len = sources.iter().map(|s| s.len()).max().unwrap_or(0);

    let mut len_hi = 0u8;
    let mut len_lo = 0u8;
    let mut data = vec![0u8; max_len];
    for (j, src) in sources.iter().enumerate() {
        let c = coeffs[j];
        if c == 0 {
            continue;
        }
        let len = src.len() as u16;
        len_hi ^= gf256::mul(c, (len >> 8) as u8);
        len_lo ^= gf256::mul(c, (len & 0xFF) as u8);
        for (b, &byte) in src.iter().enumerate() {
            data[b] ^= gf256::mul(c, byte);
        }
    }
    CodedPayload {
        enc_len: ((len_hi as u16) << 8) | len_lo as u16,
        data,
    }
}

// ─── Decoding ───────────────────────────────────────────────────────────────

/// Receive-side state for one group: directly received sources plus coded
/// packets awaiting enough rank to solve.
pub struct GroupDecoder {
    k: usize,
    sources: Vec<Option<Bytes>>,
    coded: Vec<(usize, CodedPayload)>,
}

impl GroupDecoder {
    pub fn new(k: usize) -> Self {
        GroupDecoder {
            k,
            sources: vec![None; k],
            coded: Vec::new(),
        }
    }

    /// Record a directly received source packet by its group index.
    pub fn add_source(&mut self, idx: usize, payload: Bytes) {
        if idx < self.k && self.sources[idx].is_none() {
            self.sources[idx] = Some(payload);
        }
    }

    /// Record a coded packet by its degree-of-freedom index.
    pub fn add_coded(&mut self, idx: usize, payload: CodedPayload) {
        if idx >= self.k && idx < MAX_DOF_INDEX && !self.coded.iter().any(|(i, _)| *i == idx) {
            self.coded.push((idx, payload));
        }
    }

    pub fn src_received(&self) -> usize {
        self.sources.iter().filter(|s| s.is_some()).count()
    }

    pub fn coded_received(&self) -> usize {
        self.coded.len()
    }

    pub fn has_source(&self, idx: usize) -> bool {
        idx < self.k && self.sources[idx].is_some()
    }

    /// Whether enough degrees of freedom have arrived to reconstruct the
    /// whole group.
    pub fn decodable(&self) -> bool {
        self.src_received() + self.coded_received() >= self.k
    }

    /// Solve for the missing sources. Returns the recovered (index, payload)
    /// pairs, or `None` when the rank is still insufficient.
    pub fn recover(&mut self, matrix: &CodingMatrix) -> Option<Vec<(usize, Bytes)>> {
        if !self.decodable() {
            return None;
        }
        let missing: Vec<usize> = (0..self.k).filter(|&i| self.sources[i].is_none()).collect();
        if missing.is_empty() {
            return Some(Vec::new());
        }
        let m = missing.len();
        let width = 2 + self
            .coded
            .iter()
            .map(|(_, c)| c.data.len())
            .max()
            .unwrap_or(0);

        // Build the reduced system: coded rows restricted to the missing
        // columns, right-hand sides with known sources subtracted out.
        let mut coeffs: Vec<Vec<u8>> = Vec::with_capacity(m);
        let mut rhs: Vec<Vec<u8>> = Vec::with_capacity(m);
        for (idx, coded) in self.coded.iter().take(m) {
            let row = matrix.coded_row(*idx);
            coeffs.push(missing.iter().map(|&j| row[j]).collect());

            let mut v = vec![0u8; width];
            v[0] = (coded.enc_len >> 8) as u8;
            v[1] = (coded.enc_len & 0xFF) as u8;
            v[2..2 + coded.data.len()].copy_from_slice(&coded.data);
            for (j, src) in self.sources.iter().enumerate() {
                let Some(src) = src else { continue };
                let c = row[j];
                if c == 0 {
                    continue;
                }
                let len = src.len() as u16;
                v[0] ^= gf256::mul(c, (len >> 8) as u8);
                v[1] ^= gf256::mul(c, (len & 0xFF) as u8);
                for (b, &byte) in src.iter().enumerate() {
                    v[2 + b] ^= gf256::mul(c, byte);
                }
            }
            rhs.push(v);
        }

        // Gauss-Jordan on the m×m system with vector right-hand sides.
        for col in 0..m {
            let pivot = (col..m).find(|&r| coeffs[r][col] != 0)?;
            coeffs.swap(col, pivot);
            rhs.swap(col, pivot);

            let scale = gf256::inv(coeffs[col][col]);
            for j in 0..m {
                coeffs[col][j] = gf256::mul(coeffs[col][j], scale);
            }
            for b in rhs[col].iter_mut() {
                *b = gf256::mul(*b, scale);
            }
            for row in 0..m {
                if row == col || coeffs[row][col] == 0 {
                    continue;
                }
                let factor = coeffs[row][col];
                let pivot_coeffs = coeffs[col].clone();
                let pivot_rhs = rhs[col].clone();
                for j in 0..m {
                    coeffs[row][j] ^= gf256::mul(factor, pivot_coeffs[j]);
                }
                for (b, &pb) in rhs[row].iter_mut().zip(pivot_rhs.iter()) {
                    *b ^= gf256::mul(factor, pb);
                }
            }
        }

        let mut recovered = Vec::with_capacity(m);
        for (row, &src_idx) in missing.iter().enumerate() {
            let v = &rhs[row];
            let len = (((v[0] as u16) << 8) | v[1] as u16) as usize;
            if 2 + len > v.len() {
                return None; // corrupt length — treat as undecodable
            }
            let payload = Bytes::copy_from_slice(&v[2..2 + len]);
            self.sources[src_idx] = Some(payload.clone());
            recovered.push((src_idx, payload));
        }
        Some(recovered)
    }
}
