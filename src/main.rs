// SPDX-License-Identifier: Apache-2.0

//! `nvclaimd` — the GPU arbiter daemon.

use anyhow::{Context, Result};
use log::info;

use nvclaim::config::Config;
use nvclaim::gate::DevNodes;
use nvclaim::must;
use nvclaim::probe::NvmlProbe;
use nvclaim::server::Arbiter;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    must!(run(Config::default()));
}

fn run(cfg: Config) -> Result<()> {
    let gate = DevNodes::new();

    // Driver initialisation resets device-node ownership to root, so the
    // owners are snapshotted first and re-applied once NVML is up.
    let owners = gate
        .snapshot_owners()
        .context("could not snapshot device-node owners")?;
    info!("snapshotted owners of {} device nodes", owners.len());

    let probe = NvmlProbe::init()?;

    let mut arbiter = Arbiter::new(cfg, probe, gate)?;
    arbiter.restore_owners(&owners)?;
    arbiter.run()
}
