#![no_main]
use libfuzzer_sys::fuzz_target;
use gosh_swarm::ContentRange;

fuzz_target!(|data: &str| {
    // parse() should never panic on arbitrary header values
    if let Some(range) = ContentRange::parse(data) {
        assert!(range.start <= range.end);
    }
});
