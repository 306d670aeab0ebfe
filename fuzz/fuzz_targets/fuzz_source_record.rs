#![no_main]
use libfuzzer_sys::fuzz_target;
use gosh_swarm::persist::decode_records;
use gosh_swarm::SourceRecord;

fuzz_target!(|data: &str| {
    // Malformed lines are skipped, never a panic
    for record in decode_records(data) {
        let _ = SourceRecord::parse_line(&record.encode(), 1);
    }
});
