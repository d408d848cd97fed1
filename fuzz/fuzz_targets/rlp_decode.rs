#![no_main]
use libfuzzer_sys::fuzz_target;

// Raw transaction bytes come straight from the intake queue.
// Decoding must reject garbage with an error, never panic or over-allocate.
fuzz_target!(|data: &[u8]| {
    if let Ok(item) = stakenode::normalize::rlp::decode(data) {
        // re-encoding what was accepted must not panic either
        let _ = item.encode();
    }
    let _ = stakenode::normalize::Envelope::decode(data);
});
