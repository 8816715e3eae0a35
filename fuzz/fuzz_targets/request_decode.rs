//! Fuzz target for the wire request decoder.
//!
//! Clients are unprivileged and untrusted; arbitrary bytes on the socket
//! must never panic the arbiter.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nvclaim::protocol;

fuzz_target!(|data: &[u8]| {
    // Ignore result - we're testing for panics, not correctness
    let _ = protocol::decode_request(data);
});
