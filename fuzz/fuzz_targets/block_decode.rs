#![no_main]

use libfuzzer_sys::fuzz_target;
use minlz_core::block;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes fed to the decoder must error, never panic.
    // Tests handling of:
    // - Truncated literal runs and copy ops
    // - Copy offsets past the start of the output
    // - Output overflow
    let mut out = vec![0u8; data.len().saturating_mul(4).min(1 << 20)];
    let _ = block::decode(&mut out, data);

    // Treating the input as a block must roundtrip at every level.
    let mut dst = vec![0u8; block::max_encoded_len(data.len())];
    for encode in [
        block::encode_fastest,
        block::encode_balanced,
        block::encode_smallest,
    ] {
        let n = encode(&mut dst, data);
        if n > 0 {
            let mut rt = vec![0u8; data.len()];
            let produced =
                block::decode(&mut rt, &dst[..n]).expect("encoder produced undecodable block");
            assert_eq!(produced, data.len());
            assert_eq!(&rt[..], data);
        }
    }
});
