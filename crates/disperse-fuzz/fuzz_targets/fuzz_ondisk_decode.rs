//! On-disk metadata decoding must never panic on arbitrary bytes, and
//! ADD_ARRAY64 must stay length-safe.

#![no_main]

use libfuzzer_sys::fuzz_target;

use disperse_core::ondisk;

fuzz_target!(|input: &[u8]| {
    let _ = ondisk::ConfigRecord::decode(input);
    let _ = ondisk::decode_u64(input);
    let _ = ondisk::decode_u64_pair(input);

    if input.len() >= 2 {
        let split = input.len() / 2;
        let _ = ondisk::add_array64(&input[..split], &input[split..]);
    }
});
