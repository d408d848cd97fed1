#![no_main]
use libfuzzer_sys::fuzz_target;

// A ledger file damaged on disk must surface as Corrupt/BadMagic, not a crash.
fuzz_target!(|data: &[u8]| {
    let _ = stakenode::ledger::binary::scan(data);
    let _ = stakenode::ledger::binary::read_blocks(data);

    // valid header in front of arbitrary records
    let mut image = Vec::with_capacity(16 + data.len());
    image.extend_from_slice(stakenode::ledger::binary::MAGIC);
    image.extend_from_slice(&stakenode::ledger::binary::VERSION.to_le_bytes());
    image.extend_from_slice(&[0u8; 8]);
    image.extend_from_slice(data);
    let _ = stakenode::ledger::binary::read_blocks(&image);
});
