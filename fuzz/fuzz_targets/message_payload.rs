#![no_main]

use libfuzzer_sys::fuzz_target;

use devsim_core::{embedded_timestamp, Message};

fuzz_target!(|data: &[u8]| {
    let timestamp = embedded_timestamp(data);
    if let Ok(message) = Message::from_payload(data) {
        assert_eq!(timestamp, Some(message.timestamp));
    }
});
