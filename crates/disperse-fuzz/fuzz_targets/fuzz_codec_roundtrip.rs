//! Any input, padded to a stripe, must round-trip through encode and a
//! decode from an arbitrary K-subset chosen from the input bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;

use disperse_codec::{FragmentCodec, RsCodec};

fuzz_target!(|input: &[u8]| {
    if input.len() < 2 {
        return;
    }
    let k = usize::from(input[0] % 6) + 2; // 2..=7
    let m = usize::from(input[1] % 3) + 1; // 1..=3
    let codec = RsCodec::new(k, m, 64);

    let stripe = codec.stripe_size();
    let mut data = input[2..].to_vec();
    let padded = data.len().div_ceil(stripe).max(1) * stripe;
    data.resize(padded, 0);

    let fragments = codec.encode(&data).expect("aligned encode succeeds");

    // Pick K distinct fragment indices from the input tail.
    let mut picked = Vec::new();
    let mut cursor = input.iter().cycle();
    while picked.len() < k {
        let idx = usize::from(*cursor.next().expect("cycle never ends")) % (k + m);
        if !picked.iter().any(|&(i, _)| i == idx) {
            picked.push((idx, fragments[idx].as_slice()));
        }
    }

    let rebuilt = codec.decode(&picked).expect("any K fragments decode");
    assert_eq!(rebuilt, data);
});
