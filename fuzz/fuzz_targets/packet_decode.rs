#![no_main]

use libfuzzer_sys::fuzz_target;

use devsim_wire::Packet;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic, and whatever decodes must re-encode
    // to a packet that decodes the same way
    if let Ok(Some((packet, used))) = Packet::decode(data) {
        assert!(used <= data.len());
        let bytes = packet.to_bytes().expect("decoded packet re-encodes");
        let (again, _) = Packet::decode(&bytes)
            .expect("re-encoded packet decodes")
            .expect("re-encoded packet is complete");
        assert_eq!(packet, again);
    }
});
