// SPDX-License-Identifier: Apache-2.0

//! Wire protocol between the arbiter and its clients.
//!
//! Requests form a tagged union; the variant index is the wire tag, so the
//! variant order below is ABI. New variants and new record fields may only be
//! appended, never removed or reordered. Responses are bare records: each
//! request kind knows which record answers it.
//!
//! Time points are unsigned 64-bit millisecond counts since the epoch of the
//! clock that produced them (monotonic for `last_used_ms`, wall clock for
//! `submitted_at_ms`).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for a single request frame. Anything larger is malformed.
pub const MAX_REQUEST_BYTES: usize = 512;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("could not encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("malformed message: {0}")]
    Decode(#[source] bincode::Error),
    #[error("request frame of {0} bytes exceeds the {MAX_REQUEST_BYTES} byte limit")]
    Oversize(usize),
}

/// Everything a client can ask of the arbiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Snapshot of cards, queue and maintenance flag.
    Status,
    /// Reserve `num_gpus` cards. The reply arrives once the job is fulfilled
    /// or rejected; `wait` is carried for the client's own bookkeeping and
    /// ignored by the server.
    Claim { num_gpus: u32, wait: bool },
    /// Give back cards previously claimed by this user.
    Release { gpus: Vec<u32> },
    /// Attach this connection to cards already reserved by the same user, so
    /// that the reservation survives the original connection.
    CoRun { gpus: Vec<u32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub uid: u32,
    pub pid: u32,
    pub memory: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub index: u32,
    pub minor: u32,
    pub name: String,
    pub uuid: String,
    pub compute_pct: u8,
    pub mem_total: u64,
    pub mem_used: u64,
    pub reserved_by_uid: u32,
    pub processes: Vec<Process>,
    pub last_used_ms: u64,
    pub temp_c: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub uid: u32,
    pub pid: i32,
    pub num_gpus: u32,
    /// Reserved for a future admission policy; carried but never consulted.
    pub priority: f32,
    pub submitted_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub cards: Vec<Card>,
    pub queue: Vec<Job>,
    pub maintenance: bool,
}

/// Answer to both `Claim` and `CoRun`. Exactly one of `claimed` and `error`
/// is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub claimed: Vec<Card>,
    pub error: String,
}

impl ClaimResponse {
    pub fn granted(claimed: Vec<Card>) -> Self {
        Self {
            claimed,
            error: String::new(),
        }
    }

    pub fn denied(error: impl Into<String>) -> Self {
        Self {
            claimed: Vec::new(),
            error: error.into(),
        }
    }
}

/// Empty `errors` means every listed card was released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub errors: String,
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(msg).map_err(CodecError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(CodecError::Decode)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, CodecError> {
    if bytes.len() > MAX_REQUEST_BYTES {
        return Err(CodecError::Oversize(bytes.len()));
    }
    decode(bytes)
}
