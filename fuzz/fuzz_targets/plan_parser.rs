#![no_main]

use libfuzzer_sys::fuzz_target;
use racetrap::persistence::{parse_bug_line, parse_plan_line};

fuzz_target!(|data: &[u8]| {
    // Plan and bug files are read line by line from disk; no input may panic
    if let Ok(input) = std::str::from_utf8(data) {
        for line in input.lines() {
            let _ = parse_plan_line(line);
            let _ = parse_bug_line(line);
        }
    }
});
