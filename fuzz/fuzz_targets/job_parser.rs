#![no_main]

use libfuzzer_sys::fuzz_target;
use phaselens::job::JobDescription;
use phaselens::time::Time;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Malformed jobs must be rejected with an error, never a panic
        let _ = JobDescription::from_json(input).and_then(|d| d.load(Time::default()));
    }
});
