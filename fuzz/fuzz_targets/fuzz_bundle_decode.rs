#![no_main]

use libfuzzer_sys::fuzz_target;
use latency_mitigator::core::codec::BundleCodec;

fuzz_target!(|data: &[u8]| {
    // Decoding must fail cleanly on anything malformed
    let mut codec = BundleCodec::new();
    if let Ok(decoded) = codec.decode(data) {
        // Whatever decoded must encode again under the same header
        let _ = codec.encode(&decoded.header, &decoded.messages);
    }
});
