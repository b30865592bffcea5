//! Systematic Reed-Solomon codec built from a Vandermonde matrix.
//!
//! The N x K encoding matrix starts as a Vandermonde matrix over distinct
//! evaluation points; multiplying by the inverse of its top K x K block
//! turns the first K rows into the identity, so data fragments are stored
//! verbatim and only redundancy fragments cost arithmetic. Any K rows of
//! the resulting matrix remain invertible, which is what decode relies on.

use crate::gf256::Gf256;
use crate::{CodecError, FragmentCodec};

#[derive(Debug, Clone)]
pub struct RsCodec {
    gf: Gf256,
    k: usize,
    m: usize,
    fragment_size: usize,
    /// N x K systematic encoding matrix, row-major.
    encode_matrix: Vec<u8>,
}

impl RsCodec {
    /// Build a codec for `k` data + `m` redundancy fragments of
    /// `fragment_size` bytes each. Requires `k >= 1`, `m >= 1` and
    /// `k + m <= 255`.
    pub fn new(k: usize, m: usize, fragment_size: usize) -> Self {
        assert!(k >= 1 && m >= 1, "need at least one data and one redundancy fragment");
        assert!(k + m <= 255, "GF(2^8) supports at most 255 bricks");

        let gf = Gf256::new();
        let n = k + m;

        // Vandermonde over evaluation points 0..n.
        let mut vandermonde = vec![0u8; n * k];
        for row in 0..n {
            for col in 0..k {
                vandermonde[row * k + col] = gf.pow(row as u8, col);
            }
        }

        let top_inv = invert(&gf, &vandermonde[..k * k], k)
            .expect("top block of a Vandermonde matrix is invertible");

        let mut encode_matrix = vec![0u8; n * k];
        for row in 0..n {
            for col in 0..k {
                let mut acc = 0u8;
                for t in 0..k {
                    acc ^= gf.mul(vandermonde[row * k + t], top_inv[t * k + col]);
                }
                encode_matrix[row * k + col] = acc;
            }
        }

        Self {
            gf,
            k,
            m,
            fragment_size,
            encode_matrix,
        }
    }
}

/// Invert a k x k matrix by Gauss-Jordan elimination. Returns None when
/// the matrix is singular.
fn invert(gf: &Gf256, matrix: &[u8], k: usize) -> Option<Vec<u8>> {
    let mut work = matrix.to_vec();
    let mut inv = vec![0u8; k * k];
    for i in 0..k {
        inv[i * k + i] = 1;
    }

    for col in 0..k {
        // Find a pivot row.
        let pivot = (col..k).find(|&r| work[r * k + col] != 0)?;
        if pivot != col {
            for c in 0..k {
                work.swap(pivot * k + c, col * k + c);
                inv.swap(pivot * k + c, col * k + c);
            }
        }

        let p = work[col * k + col];
        let p_inv = gf.inv(p);
        for c in 0..k {
            work[col * k + c] = gf.mul(work[col * k + c], p_inv);
            inv[col * k + c] = gf.mul(inv[col * k + c], p_inv);
        }

        for r in 0..k {
            if r == col {
                continue;
            }
            let factor = work[r * k + col];
            if factor == 0 {
                continue;
            }
            for c in 0..k {
                let w = gf.mul(factor, work[col * k + c]);
                work[r * k + c] ^= w;
                let v = gf.mul(factor, inv[col * k + c]);
                inv[r * k + c] ^= v;
            }
        }
    }

    Some(inv)
}

impl FragmentCodec for RsCodec {
    fn fragments(&self) -> usize {
        self.k
    }

    fn redundancy(&self) -> usize {
        self.m
    }

    fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        let stripe = self.stripe_size();
        if data.is_empty() || data.len() % stripe != 0 {
            return Err(CodecError::UnalignedInput {
                len: data.len(),
                stripe,
            });
        }

        let n = self.nodes();
        let frag_total = data.len() / self.k;
        let per_stripe = stripe / self.k;
        let stripes = data.len() / stripe;

        let mut out = vec![vec![0u8; frag_total]; n];

        for s in 0..stripes {
            let base = s * stripe;
            for (row, frag) in out.iter_mut().enumerate() {
                let dst = &mut frag[s * per_stripe..(s + 1) * per_stripe];
                for col in 0..self.k {
                    let coef = self.encode_matrix[row * self.k + col];
                    let src = &data[base + col * per_stripe..base + (col + 1) * per_stripe];
                    self.gf.mul_acc(dst, src, coef);
                }
            }
        }

        Ok(out)
    }

    fn decode(&self, available: &[(usize, &[u8])]) -> Result<Vec<u8>, CodecError> {
        if available.len() < self.k {
            return Err(CodecError::NotEnoughFragments {
                need: self.k,
                got: available.len(),
            });
        }
        let chosen = &available[..self.k];

        let frag_len = chosen[0].1.len();
        let mut seen = vec![false; self.nodes()];
        for &(idx, frag) in chosen {
            if idx >= self.nodes() {
                return Err(CodecError::BadFragmentIndex {
                    idx,
                    nodes: self.nodes(),
                });
            }
            if seen[idx] {
                return Err(CodecError::DuplicateFragment { idx });
            }
            seen[idx] = true;
            if frag.len() != frag_len {
                return Err(CodecError::LengthMismatch);
            }
        }
        if frag_len == 0 || frag_len % (self.stripe_size() / self.k) != 0 {
            return Err(CodecError::UnalignedFragment {
                len: frag_len,
                fragment: self.stripe_size() / self.k,
            });
        }

        // Sub-matrix of the encode matrix for the surviving rows.
        let mut sub = vec![0u8; self.k * self.k];
        for (r, &(idx, _)) in chosen.iter().enumerate() {
            sub[r * self.k..(r + 1) * self.k]
                .copy_from_slice(&self.encode_matrix[idx * self.k..(idx + 1) * self.k]);
        }
        let decode_matrix = invert(&self.gf, &sub, self.k)
            .expect("any K rows of a systematic Vandermonde-derived matrix are independent");

        let mut data = vec![0u8; frag_len * self.k];
        let per_stripe = self.stripe_size() / self.k;
        let stripes = frag_len / per_stripe;

        for s in 0..stripes {
            for col in 0..self.k {
                let base = s * self.stripe_size() + col * per_stripe;
                let dst = &mut data[base..base + per_stripe];
                for (r, &(_, frag)) in chosen.iter().enumerate() {
                    let coef = decode_matrix[col * self.k + r];
                    let src = &frag[s * per_stripe..(s + 1) * per_stripe];
                    self.gf.mul_acc(dst, src, coef);
                }
            }
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matrix_is_systematic() {
        let codec = RsCodec::new(4, 2, 16);
        for row in 0..4 {
            for col in 0..4 {
                let want = if row == col { 1 } else { 0 };
                assert_eq!(codec.encode_matrix[row * 4 + col], want);
            }
        }
    }

    #[test]
    fn invert_roundtrip() {
        let gf = Gf256::new();
        let m = vec![1, 2, 3, 4, 5, 6, 7, 8, 10];
        let inv = invert(&gf, &m, 3).unwrap();
        // m * inv must be the identity.
        for r in 0..3 {
            for c in 0..3 {
                let mut acc = 0u8;
                for t in 0..3 {
                    acc ^= gf.mul(m[r * 3 + t], inv[t * 3 + c]);
                }
                assert_eq!(acc, if r == c { 1 } else { 0 });
            }
        }
    }

    #[test]
    fn singular_matrix_is_rejected() {
        let gf = Gf256::new();
        // Two identical rows.
        let m = vec![1, 2, 1, 2];
        assert!(invert(&gf, &m, 2).is_none());
    }
}
