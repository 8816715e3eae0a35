// SPDX-License-Identifier: Apache-2.0

//! Common macros for the arbiter binaries.

/// Unwrap a Result or panic with a descriptive startup failure message.
/// Used for operations that must succeed before the arbiter can serve.
#[macro_export]
macro_rules! must {
    ($expr:expr) => {
        if let Err(e) = $expr {
            panic!("startup failure: {} => {e:#}", stringify!($expr));
        }
    };
    ($expr:expr, $msg:literal) => {
        if let Err(e) = $expr {
            panic!("startup failure: {}: {e:#}", $msg);
        }
    };
}
