#![no_main]

use libfuzzer_sys::fuzz_target;
use tapline_core::crypto::decrypt;

const KEY: [u8; 32] = [0x42; 32];

fuzz_target!(|data: &[u8]| {
    // Arbitrary datagrams must only ever produce an error, never a panic.
    let _ = decrypt(data, &KEY);
});
