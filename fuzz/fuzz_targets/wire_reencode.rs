#![no_main]

use libfuzzer_sys::fuzz_target;

use tether_proto::WireMessage;

// Any frame that decodes must encode back to something that decodes to
// the same frame.
fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(msg) = WireMessage::decode(raw) else {
        return;
    };
    let encoded = msg.encode().unwrap();
    let again = WireMessage::decode(&encoded).unwrap();
    assert_eq!(msg, again);
});
