//! Fragment codec for dispersed (erasure-coded) volumes.
//!
//! A volume of N bricks stores each stripe of `fragments * fragment_size`
//! logical bytes as N fragments of `fragment_size` bytes, any `fragments`
//! of which suffice to rebuild the stripe. The translator core only
//! depends on the [`FragmentCodec`] trait; [`RsCodec`] is the default
//! systematic Reed-Solomon implementation over GF(2^8).

pub mod gf256;
mod matrix;

use thiserror::Error;

pub use matrix::RsCodec;

/// Errors reported by fragment encode/decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("input length {len} is not a multiple of the stripe size {stripe}")]
    UnalignedInput { len: usize, stripe: usize },
    #[error("fragment length {len} is not a multiple of the fragment size {fragment}")]
    UnalignedFragment { len: usize, fragment: usize },
    #[error("need {need} fragments to decode, got {got}")]
    NotEnoughFragments { need: usize, got: usize },
    #[error("fragment index {idx} out of range for {nodes} bricks")]
    BadFragmentIndex { idx: usize, nodes: usize },
    #[error("duplicate fragment index {idx}")]
    DuplicateFragment { idx: usize },
    #[error("fragments have differing lengths")]
    LengthMismatch,
}

/// K-of-N erasure codec over fixed-size fragments.
///
/// `encode` consumes a buffer whose length is a multiple of the stripe
/// size and produces one fragment buffer per brick; `decode` rebuilds the
/// original buffer from any `fragments()` surviving fragment buffers.
pub trait FragmentCodec: Send + Sync {
    /// Number of data fragments (K).
    fn fragments(&self) -> usize;

    /// Number of redundancy fragments (M).
    fn redundancy(&self) -> usize;

    /// Total brick count (N = K + M).
    fn nodes(&self) -> usize {
        self.fragments() + self.redundancy()
    }

    /// Bytes of one fragment per stripe.
    fn fragment_size(&self) -> usize;

    /// Bytes of logical data per stripe.
    fn stripe_size(&self) -> usize {
        self.fragments() * self.fragment_size()
    }

    /// Split `data` (a whole number of stripes) into N fragment buffers.
    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, CodecError>;

    /// Rebuild the original data from `fragments()` surviving fragments,
    /// each tagged with its brick index.
    fn decode(&self, available: &[(usize, &[u8])]) -> Result<Vec<u8>, CodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic xorshift so test data is reproducible.
    pub(crate) fn fill_pattern(buf: &mut [u8], mut seed: u64) {
        for b in buf.iter_mut() {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            *b = seed as u8;
        }
    }

    #[test]
    fn trait_derived_sizes() {
        let codec = RsCodec::new(4, 2, 512);
        assert_eq!(codec.nodes(), 6);
        assert_eq!(codec.stripe_size(), 2048);
    }

    #[test]
    fn encode_decode_roundtrip_all_k_subsets() {
        let codec = RsCodec::new(4, 2, 64);
        let mut data = vec![0u8; codec.stripe_size() * 3];
        fill_pattern(&mut data, 0x1234_5678_9abc_def0);

        let frags = codec.encode(&data).unwrap();
        assert_eq!(frags.len(), 6);
        for f in &frags {
            assert_eq!(f.len(), data.len() / 4);
        }

        // Every 4-subset of the 6 fragments must rebuild the data.
        for a in 0..6 {
            for b in (a + 1)..6 {
                for c in (b + 1)..6 {
                    for d in (c + 1)..6 {
                        let picked = [a, b, c, d]
                            .iter()
                            .map(|&i| (i, frags[i].as_slice()))
                            .collect::<Vec<_>>();
                        let rebuilt = codec.decode(&picked).unwrap();
                        assert_eq!(rebuilt, data, "subset {:?}", [a, b, c, d]);
                    }
                }
            }
        }
    }

    #[test]
    fn decode_order_does_not_matter() {
        let codec = RsCodec::new(3, 2, 32);
        let mut data = vec![0u8; codec.stripe_size()];
        fill_pattern(&mut data, 99);
        let frags = codec.encode(&data).unwrap();

        let picked = vec![
            (4usize, frags[4].as_slice()),
            (0usize, frags[0].as_slice()),
            (2usize, frags[2].as_slice()),
        ];
        assert_eq!(codec.decode(&picked).unwrap(), data);
    }

    #[test]
    fn systematic_prefix_is_plain_data() {
        let codec = RsCodec::new(4, 2, 16);
        let mut data = vec![0u8; codec.stripe_size() * 2];
        fill_pattern(&mut data, 7);
        let frags = codec.encode(&data).unwrap();

        // Two stripes: fragment i holds stripe0[i] then stripe1[i].
        let frag = data.len() / 4;
        let stripe = codec.stripe_size();
        for i in 0..4 {
            let per_stripe = frag / 2;
            assert_eq!(
                &frags[i][..per_stripe],
                &data[i * per_stripe..(i + 1) * per_stripe]
            );
            assert_eq!(
                &frags[i][per_stripe..],
                &data[stripe + i * per_stripe..stripe + (i + 1) * per_stripe]
            );
        }
    }

    #[test]
    fn encode_rejects_unaligned_input() {
        let codec = RsCodec::new(4, 2, 64);
        let err = codec.encode(&[0u8; 100]).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnalignedInput {
                len: 100,
                stripe: 256
            }
        );
    }

    #[test]
    fn decode_rejects_short_and_bad_sets() {
        let codec = RsCodec::new(4, 2, 16);
        let mut data = vec![0u8; codec.stripe_size()];
        fill_pattern(&mut data, 3);
        let frags = codec.encode(&data).unwrap();

        let two = vec![(0usize, frags[0].as_slice()), (1usize, frags[1].as_slice())];
        assert_eq!(
            codec.decode(&two).unwrap_err(),
            CodecError::NotEnoughFragments { need: 4, got: 2 }
        );

        let dup = vec![
            (0usize, frags[0].as_slice()),
            (0usize, frags[0].as_slice()),
            (1usize, frags[1].as_slice()),
            (2usize, frags[2].as_slice()),
        ];
        assert_eq!(
            codec.decode(&dup).unwrap_err(),
            CodecError::DuplicateFragment { idx: 0 }
        );

        let oob = vec![
            (9usize, frags[0].as_slice()),
            (1usize, frags[1].as_slice()),
            (2usize, frags[2].as_slice()),
            (3usize, frags[3].as_slice()),
        ];
        assert_eq!(
            codec.decode(&oob).unwrap_err(),
            CodecError::BadFragmentIndex { idx: 9, nodes: 6 }
        );
    }

    #[test]
    fn corrupt_fragment_yields_wrong_data_not_panic() {
        let codec = RsCodec::new(4, 2, 16);
        let mut data = vec![0u8; codec.stripe_size()];
        fill_pattern(&mut data, 11);
        let mut frags = codec.encode(&data).unwrap();
        frags[5][0] ^= 0xff;

        let picked = vec![
            (1usize, frags[1].as_slice()),
            (2usize, frags[2].as_slice()),
            (3usize, frags[3].as_slice()),
            (5usize, frags[5].as_slice()),
        ];
        let rebuilt = codec.decode(&picked).unwrap();
        assert_ne!(rebuilt, data);
    }
}
