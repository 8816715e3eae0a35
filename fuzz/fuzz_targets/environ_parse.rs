//! Fuzz target for the /proc environ parser used by the sandbox helper.
//!
//! The block comes from another process's memory image; malformed UTF-8 and
//! missing separators must be skipped, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nvclaim::sandbox;

fuzz_target!(|data: &[u8]| {
    let _ = sandbox::parse_environ(data);
});
