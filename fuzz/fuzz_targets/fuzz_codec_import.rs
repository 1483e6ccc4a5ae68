#![no_main]

use keyprov::KeyCodec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary DER must be rejected cleanly, never panic
    if let Ok(key) = KeyCodec::import(data) {
        let _ = key.bits();
        let _ = key.verify(b"fuzz", data);
    }
});
