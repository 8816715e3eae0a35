// SPDX-License-Identifier: Apache-2.0

//! In-memory card state.
//!
//! The on-disk owner of `/dev/nvidia<minor>` is the authoritative record of a
//! reservation; this mirror is refreshed from the filesystem on every sample
//! and must never be trusted across a tick without a refresh.

use std::fmt;

use crate::protocol;

/// Current monotonic clock in milliseconds. Used for idle accounting.
pub fn monotonic_ms() -> u64 {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .expect("CLOCK_MONOTONIC is always available");
    ts.tv_sec() as u64 * 1_000 + ts.tv_nsec() as u64 / 1_000_000
}

/// Current wall clock in milliseconds since the UNIX epoch. Used for job
/// submission timestamps.
pub fn wall_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_millis() as u64
}

/// One process the driver reports on a card, attributed to the uid owning its
/// `/proc` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverProcess {
    pub pid: u32,
    pub uid: u32,
    pub memory: u64,
}

#[derive(Debug, Clone)]
pub struct CardState {
    pub index: u32,
    pub minor: u32,
    pub name: String,
    pub uuid: String,

    pub compute_pct: u8,
    pub mem_total: u64,
    pub mem_used: u64,
    pub temp_c: u32,
    pub processes: Vec<DriverProcess>,

    /// Mirror of the device node's owner. 0 means free.
    pub reserved_by_uid: u32,
    /// Connected client pids attached to this reservation. Stale entries are
    /// tolerated and reaped on the next tick.
    pub client_pids: Vec<i32>,
    /// Monotonic ms of the last observed activity.
    pub last_used: u64,
    /// Set on release, cleared by the next successful sample. Keeps a card
    /// out of the free set until the driver has torn down old contexts.
    pub locked_until_update: bool,
    /// Set when sampling this card failed; the card keeps its previous
    /// telemetry and is not assignable until a clean sample arrives.
    pub stale: bool,
}

impl CardState {
    pub fn new(index: u32, minor: u32, name: String, uuid: String, mem_total: u64) -> Self {
        Self {
            index,
            minor,
            name,
            uuid,
            compute_pct: 0,
            mem_total,
            mem_used: 0,
            temp_c: 0,
            processes: Vec::new(),
            reserved_by_uid: 0,
            client_pids: Vec::new(),
            last_used: monotonic_ms(),
            locked_until_update: false,
            stale: false,
        }
    }

    /// A card may be handed to the queue head only when it is unreserved,
    /// freshly sampled and has no lingering driver contexts.
    pub fn assignable(&self) -> bool {
        self.reserved_by_uid == 0
            && !self.locked_until_update
            && !self.stale
            && self.processes.is_empty()
    }

    pub fn co_run_by(&self, pid: i32) -> bool {
        self.client_pids.contains(&pid)
    }

    pub fn add_co_runner(&mut self, pid: i32) {
        if !self.client_pids.contains(&pid) {
            self.client_pids.push(pid);
        }
    }

    pub fn remove_co_runner(&mut self, pid: i32) {
        self.client_pids.retain(|&p| p != pid);
    }

    /// First driver process owned by `uid`, if any.
    pub fn process_of(&self, uid: u32) -> Option<&DriverProcess> {
        self.processes.iter().find(|p| p.uid == uid)
    }

    pub fn to_wire(&self) -> protocol::Card {
        protocol::Card {
            index: self.index,
            minor: self.minor,
            name: self.name.clone(),
            uuid: self.uuid.clone(),
            compute_pct: self.compute_pct,
            mem_total: self.mem_total,
            mem_used: self.mem_used,
            reserved_by_uid: self.reserved_by_uid,
            processes: self
                .processes
                .iter()
                .map(|p| protocol::Process {
                    uid: p.uid,
                    pid: p.pid,
                    memory: p.memory,
                })
                .collect(),
            last_used_ms: self.last_used,
            temp_c: self.temp_c,
        }
    }
}

impl fmt::Display for CardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "card {} ({}, minor {})",
            self.index, self.name, self.minor
        )
    }
}
