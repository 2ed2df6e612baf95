#![no_main]

use libfuzzer_sys::fuzz_target;

use tether_proto::WireMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(raw) = std::str::from_utf8(data) {
        let _ = WireMessage::decode(raw);
    }
});
