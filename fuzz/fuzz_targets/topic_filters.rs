#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use devsim_wire::{topic_matches, validate_filter, validate_topic};

#[derive(Arbitrary, Debug)]
struct Input {
    filter: String,
    topic: String,
}

fuzz_target!(|input: Input| {
    let _ = validate_filter(&input.filter);
    let _ = validate_topic(&input.topic);

    let _ = topic_matches(&input.filter, &input.topic);

    if validate_topic(&input.topic).is_ok() {
        // A concrete topic always matches itself and the catch-all
        assert!(topic_matches(&input.topic, &input.topic));
        if !input.topic.starts_with('$') {
            assert!(topic_matches("#", &input.topic));
        }
    }
});
