// SPDX-License-Identifier: Apache-2.0

//! Shared test utilities. Only compiled during tests.

use anyhow::{anyhow, Result};
use nix::unistd::Uid;
use std::cell::RefCell;
use std::collections::HashMap;
use std::env;
use std::process::Command;
use std::rc::Rc;

use crate::card::DriverProcess;
use crate::gate::DeviceGate;
use crate::probe::{CardSample, CardStatic, DeviceProbe};

/// Ensure a test runs as root by re-executing itself via sudo and exiting
/// with the child's code.
#[allow(dead_code)]
pub fn require_root() {
    if Uid::effective().is_root() {
        return;
    }

    let args: Vec<String> = env::args().collect();
    match Command::new("sudo").args(&args).status() {
        Ok(status) => std::process::exit(status.code().unwrap_or(1)),
        Err(e) => panic!("failed to run sudo: {}", e),
    }
}

#[derive(Debug, Default)]
pub struct FakeProbeState {
    pub statics: Vec<CardStatic>,
    pub samples: HashMap<u32, CardSample>,
    /// Indices whose next samples are scripted to fail.
    pub failing: Vec<u32>,
}

/// Scripted telemetry source. Cloning shares the underlying state so a test
/// can keep mutating samples after handing the probe to the arbiter.
#[derive(Debug, Clone, Default)]
pub struct FakeProbe {
    state: Rc<RefCell<FakeProbeState>>,
}

impl FakeProbe {
    pub fn with_cards(count: u32) -> Self {
        let probe = Self::default();
        {
            let mut state = probe.state.borrow_mut();
            for index in 0..count {
                state.statics.push(CardStatic {
                    index,
                    minor: index,
                    name: format!("Fake GPU {index}"),
                    uuid: format!("GPU-FAKE-{index:04}"),
                    mem_total: 16 << 30,
                });
            }
        }
        probe
    }

    pub fn set_processes(&self, index: u32, processes: Vec<DriverProcess>) {
        self.state
            .borrow_mut()
            .samples
            .entry(index)
            .or_default()
            .processes = processes;
    }

    pub fn fail(&self, index: u32) {
        self.state.borrow_mut().failing.push(index);
    }

    pub fn recover(&self, index: u32) {
        self.state.borrow_mut().failing.retain(|&i| i != index);
    }
}

impl DeviceProbe for FakeProbe {
    fn enumerate(&self) -> Result<Vec<CardStatic>> {
        Ok(self.state.borrow().statics.clone())
    }

    fn sample(&self, index: u32) -> Result<CardSample> {
        let state = self.state.borrow();
        if state.failing.contains(&index) {
            return Err(anyhow!("scripted sample failure for card {index}"));
        }
        let mut sample = state.samples.get(&index).cloned().unwrap_or_default();
        if let Some(card) = state.statics.iter().find(|c| c.index == index) {
            sample.mem_total = card.mem_total;
        }
        Ok(sample)
    }
}

#[derive(Debug, Default)]
pub struct FakeGateState {
    /// minor -> owning uid; absent means root.
    pub owners: HashMap<u32, u32>,
    /// minor -> permission bits; absent means 0600.
    pub modes: HashMap<u32, u32>,
    /// Minors whose openers were killed, in order.
    pub killed: Vec<u32>,
}

/// In-memory stand-in for the `/dev` tree, shared between test and arbiter.
#[derive(Debug, Clone, Default)]
pub struct FakeGate {
    state: Rc<RefCell<FakeGateState>>,
}

impl FakeGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self, minor: u32) -> u32 {
        self.state.borrow().owners.get(&minor).copied().unwrap_or(0)
    }

    pub fn set_node(&self, minor: u32, uid: u32, mode: u32) {
        let mut state = self.state.borrow_mut();
        state.owners.insert(minor, uid);
        state.modes.insert(minor, mode);
    }

    pub fn killed(&self) -> Vec<u32> {
        self.state.borrow().killed.clone()
    }
}

impl DeviceGate for FakeGate {
    fn set_owner(&self, minor: u32, uid: u32, _gid: u32) -> Result<()> {
        self.state.borrow_mut().owners.insert(minor, uid);
        Ok(())
    }

    fn owner_and_mode(&self, minor: u32) -> Result<(u32, u32)> {
        let state = self.state.borrow();
        Ok((
            state.owners.get(&minor).copied().unwrap_or(0),
            state.modes.get(&minor).copied().unwrap_or(0o600),
        ))
    }

    fn force_mode(&self, minor: u32) -> Result<()> {
        self.state.borrow_mut().modes.insert(minor, 0o600);
        Ok(())
    }

    fn kill_openers(&self, minor: u32) -> Result<()> {
        self.state.borrow_mut().killed.push(minor);
        Ok(())
    }
}
