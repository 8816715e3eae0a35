// SPDX-License-Identifier: Apache-2.0

//! GPU telemetry probe.
//!
//! NVML is the only source of driver state; everything the arbiter decides is
//! derived from what it reports here plus the device-node owner on disk. The
//! trait keeps the arbiter testable without a driver.

use anyhow::{Context, Result};
use log::warn;
use nix::sys::stat::stat;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::struct_wrappers::device::ProcessInfo;
use nvml_wrapper::Nvml;
use std::path::{Path, PathBuf};

use crate::card::DriverProcess;

/// Immutable attributes read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardStatic {
    pub index: u32,
    pub minor: u32,
    pub name: String,
    pub uuid: String,
    pub mem_total: u64,
}

/// Mutable attributes refreshed every tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardSample {
    pub compute_pct: u8,
    pub mem_total: u64,
    pub mem_used: u64,
    pub temp_c: u32,
    pub processes: Vec<DriverProcess>,
}

pub trait DeviceProbe {
    /// Enumerate devices in index order. Failure here is fatal for startup.
    fn enumerate(&self) -> Result<Vec<CardStatic>>;

    /// Sample one device. A failure marks the card stale for this tick; it
    /// does not bring the arbiter down.
    fn sample(&self, index: u32) -> Result<CardSample>;
}

pub struct NvmlProbe {
    nvml: Nvml,
    proc_root: PathBuf,
}

impl NvmlProbe {
    /// Initialising NVML resets device-node ownership; callers snapshot the
    /// owners first and restore them afterwards.
    pub fn init() -> Result<Self> {
        let nvml = Nvml::init().context("could not initialize NVML")?;
        Ok(Self {
            nvml,
            proc_root: PathBuf::from("/proc"),
        })
    }
}

impl DeviceProbe for NvmlProbe {
    fn enumerate(&self) -> Result<Vec<CardStatic>> {
        let count = self
            .nvml
            .device_count()
            .context("could not list nvidia devices")?;

        let mut cards = Vec::with_capacity(count as usize);
        for index in 0..count {
            let dev = self
                .nvml
                .device_by_index(index)
                .with_context(|| format!("could not get device {index}"))?;
            cards.push(CardStatic {
                index,
                minor: dev
                    .minor_number()
                    .with_context(|| format!("could not query minor of device {index}"))?,
                name: dev
                    .name()
                    .with_context(|| format!("could not get name of device {index}"))?,
                uuid: dev
                    .uuid()
                    .with_context(|| format!("could not get UUID of device {index}"))?,
                mem_total: dev
                    .memory_info()
                    .with_context(|| format!("could not get memory info of device {index}"))?
                    .total,
            });
        }
        Ok(cards)
    }

    fn sample(&self, index: u32) -> Result<CardSample> {
        let dev = self
            .nvml
            .device_by_index(index)
            .with_context(|| format!("could not get device {index}"))?;

        let mem = dev.memory_info().context("could not get memory info")?;
        let util = dev
            .utilization_rates()
            .context("could not get utilization")?;
        let temp = dev
            .temperature(TemperatureSensor::Gpu)
            .context("could not get temperature")?;

        // Process listing errors are tolerated like the rest of the driver's
        // soft failures: an empty list, not a dead arbiter.
        let compute = dev.running_compute_processes().unwrap_or_else(|e| {
            warn!("could not list compute processes of device {index}: {e}");
            Vec::new()
        });
        let graphics = dev.running_graphics_processes().unwrap_or_else(|e| {
            warn!("could not list graphics processes of device {index}: {e}");
            Vec::new()
        });

        let merged = merge_process_lists(
            compute.iter().map(process_entry),
            graphics.iter().map(process_entry),
        );
        let processes = attribute_uids(merged, &self.proc_root);

        Ok(CardSample {
            compute_pct: util.gpu.min(100) as u8,
            mem_total: mem.total,
            mem_used: mem.used,
            temp_c: temp,
            processes,
        })
    }
}

fn process_entry(info: &ProcessInfo) -> (u32, u64) {
    let memory = match info.used_gpu_memory {
        UsedGpuMemory::Used(bytes) => bytes,
        UsedGpuMemory::Unavailable => 0,
    };
    (info.pid, memory)
}

/// Union of the compute and graphics context lists, de-duplicated by pid with
/// memory accumulated. A process with both context kinds appears once.
pub fn merge_process_lists(
    compute: impl IntoIterator<Item = (u32, u64)>,
    graphics: impl IntoIterator<Item = (u32, u64)>,
) -> Vec<(u32, u64)> {
    let mut merged: Vec<(u32, u64)> = Vec::new();
    for (pid, memory) in compute.into_iter().chain(graphics) {
        match merged.iter_mut().find(|(p, _)| *p == pid) {
            Some((_, m)) => *m += memory,
            None => merged.push((pid, memory)),
        }
    }
    merged
}

/// Attribute each pid to the uid owning its `/proc` entry. Processes whose
/// entry has vanished are dropped: they are already gone.
pub fn attribute_uids(pids: Vec<(u32, u64)>, proc_root: &Path) -> Vec<DriverProcess> {
    pids.into_iter()
        .filter_map(|(pid, memory)| match stat(&proc_root.join(pid.to_string())) {
            Ok(st) => Some(DriverProcess {
                pid,
                uid: st.st_uid,
                memory,
            }),
            Err(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_merge_disjoint_lists() {
        let merged = merge_process_lists(vec![(10, 100), (11, 200)], vec![(12, 300)]);
        assert_eq!(merged, vec![(10, 100), (11, 200), (12, 300)]);
    }

    #[test]
    fn test_merge_accumulates_memory_for_shared_pid() {
        // A process with both a compute and a graphics context must appear
        // once, with its memory summed.
        let merged = merge_process_lists(vec![(10, 100)], vec![(10, 50), (11, 25)]);
        assert_eq!(merged, vec![(10, 150), (11, 25)]);
    }

    #[test]
    fn test_merge_empty() {
        assert!(merge_process_lists(vec![], vec![]).is_empty());
    }

    #[test]
    fn test_attribute_uids_drops_vanished_processes() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("4321")).unwrap();

        let procs = attribute_uids(vec![(4321, 7), (999_999, 1)], tmp.path());
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 4321);
        assert_eq!(procs[0].uid, Uid::current().as_raw());
        assert_eq!(procs[0].memory, 7);
    }

    #[test]
    fn test_attribute_uids_against_real_proc() {
        let me = std::process::id();
        let procs = attribute_uids(vec![(me, 0)], Path::new("/proc"));
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].uid, Uid::effective().as_raw());
    }
}
