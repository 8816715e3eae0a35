// SPDX-License-Identifier: Apache-2.0

//! Device-node gate.
//!
//! Reservations are enforced by the kernel: a card belongs to a user exactly
//! while `/dev/nvidia<minor>` is owned by that uid with mode 0600. The gate is
//! the only place that touches node ownership.

use anyhow::{Context, Result};
use log::{info, warn};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::stat;
use nix::unistd::{chown, Gid, Pid, Uid, User};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::card::CardState;

/// Reserved nodes get group "nogroup" so group bits never grant anything.
const NOGROUP: u32 = 65534;

/// Mode bits that must never appear on a device node.
const LOOSE_MODE_BITS: u32 = 0o066;

/// Filesystem operations on `/dev/nvidia*` plus the reservation state
/// transitions built on them. Implemented for the real `/dev` tree and for
/// the in-memory stand-in used by server tests.
pub trait DeviceGate {
    fn set_owner(&self, minor: u32, uid: u32, gid: u32) -> Result<()>;
    /// Returns (st_uid, permission bits) of the node.
    fn owner_and_mode(&self, minor: u32) -> Result<(u32, u32)>;
    fn force_mode(&self, minor: u32) -> Result<()>;
    /// Best-effort SIGKILL of processes still holding the node open.
    fn kill_openers(&self, minor: u32) -> Result<()>;

    /// Hand the card to `uid`, registering `pid` as a co-runner.
    /// `admit` of uid 0 is a release.
    fn admit(&self, card: &mut CardState, uid: u32, pid: i32, now: u64) -> Result<()> {
        if uid == 0 {
            return self.revoke(card);
        }
        self.set_owner(card.minor, uid, NOGROUP)
            .with_context(|| format!("could not hand card {} to uid {}", card.index, uid))?;
        card.reserved_by_uid = uid;
        card.add_co_runner(pid);
        card.last_used = now;
        info!("card {} claimed by uid {} ({})", card.index, uid, user_name(uid));
        Ok(())
    }

    /// Return the card to root and evict whatever still holds the node open.
    /// The card stays locked until the next clean sample so it is not handed
    /// straight back out while the driver tears down old contexts.
    fn revoke(&self, card: &mut CardState) -> Result<()> {
        self.set_owner(card.minor, 0, 0)
            .with_context(|| format!("could not return card {} to root", card.index))?;
        if let Err(e) = self.kill_openers(card.minor) {
            warn!("could not kill openers of card {}: {e:#}", card.index);
        }
        card.reserved_by_uid = 0;
        card.client_pids.clear();
        card.locked_until_update = true;
        info!("card {} released", card.index);
        Ok(())
    }

    /// Re-apply a pre-driver-init owner to a node, with group "nogroup" and
    /// mode 0600.
    fn restore_owner(&self, minor: u32, uid: u32) -> Result<()> {
        self.set_owner(minor, uid, NOGROUP)?;
        self.force_mode(minor)
    }

    /// Copy the on-disk owner into the card and strip any group/other bits
    /// another process may have opened up. The filesystem wins over whatever
    /// the arbiter believed before.
    fn reconcile(&self, card: &mut CardState) -> Result<()> {
        let (uid, mode) = self.owner_and_mode(card.minor)?;
        if mode & LOOSE_MODE_BITS != 0 {
            warn!("card {} had loose mode {:o}, forcing 0600", card.index, mode);
            self.force_mode(card.minor)?;
        }
        card.reserved_by_uid = uid;
        Ok(())
    }
}

fn user_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => "unknown".to_owned(),
    }
}

/// The real gate over a `/dev` tree. The root is injectable for tests.
#[derive(Debug, Clone)]
pub struct DevNodes {
    dev_root: PathBuf,
}

impl Default for DevNodes {
    fn default() -> Self {
        Self::new()
    }
}

impl DevNodes {
    pub fn new() -> Self {
        Self::with_root("/dev")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            dev_root: root.into(),
        }
    }

    pub fn node_path(&self, minor: u32) -> PathBuf {
        self.dev_root.join(format!("nvidia{minor}"))
    }

    /// Owners of nvidia0..n before driver init, indexed by minor. Driver
    /// initialisation resets node ownership to root; the arbiter re-applies
    /// this snapshot afterwards.
    pub fn snapshot_owners(&self) -> Result<Vec<u32>> {
        let mut owners = Vec::new();
        for minor in 0.. {
            let path = self.node_path(minor);
            match stat(&path) {
                Ok(st) => owners.push(st.st_uid),
                Err(nix::errno::Errno::ENOENT) => break,
                Err(e) => {
                    return Err(e).with_context(|| format!("could not stat {}", path.display()))
                }
            }
        }
        Ok(owners)
    }
}

impl DeviceGate for DevNodes {
    fn set_owner(&self, minor: u32, uid: u32, gid: u32) -> Result<()> {
        let path = self.node_path(minor);
        chown(
            &path,
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
        )
        .with_context(|| format!("could not set owner of {} to uid {}", path.display(), uid))
    }

    fn owner_and_mode(&self, minor: u32) -> Result<(u32, u32)> {
        let path = self.node_path(minor);
        let st = stat(&path).with_context(|| format!("could not stat {}", path.display()))?;
        Ok((st.st_uid, st.st_mode as u32 & 0o777))
    }

    fn force_mode(&self, minor: u32) -> Result<()> {
        let path = self.node_path(minor);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("could not set mode of {}", path.display()))
    }

    fn kill_openers(&self, minor: u32) -> Result<()> {
        let path = self.node_path(minor);
        kill_node_openers(&path)
    }
}

/// Processes can hold a node open without being visible to the driver; fuser
/// finds them so the next owner starts from a clean card.
fn kill_node_openers(path: &Path) -> Result<()> {
    let output = Command::new("fuser")
        .arg(path)
        .output()
        .context("could not run fuser")?;

    let me = std::process::id() as i32;
    for pid in parse_fuser_pids(&String::from_utf8_lossy(&output.stdout)) {
        if pid == me {
            continue;
        }
        info!("killing leftover process {pid}");
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
            warn!("could not kill {pid}: {e}");
        }
    }
    Ok(())
}

/// fuser prints whitespace-separated pids on stdout, possibly suffixed with
/// access letters (e.g. "1234m"). Everything unparsable is skipped.
fn parse_fuser_pids(stdout: &str) -> Vec<i32> {
    stdout
        .split_whitespace()
        .filter_map(|tok| {
            let digits = tok.trim_end_matches(|c: char| c.is_ascii_alphabetic());
            digits.parse::<i32>().ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;
    use tempfile::TempDir;

    fn fake_dev(count: u32) -> (TempDir, DevNodes) {
        let tmp = TempDir::new().unwrap();
        let gate = DevNodes::with_root(tmp.path());
        for minor in 0..count {
            fs::write(gate.node_path(minor), "").unwrap();
        }
        (tmp, gate)
    }

    #[test]
    fn test_node_path_format() {
        let gate = DevNodes::new();
        assert_eq!(gate.node_path(3), PathBuf::from("/dev/nvidia3"));
    }

    #[test]
    fn test_parse_fuser_pids() {
        assert_eq!(parse_fuser_pids("  1234 5678\n"), vec![1234, 5678]);
        assert_eq!(parse_fuser_pids("1234m 42c"), vec![1234, 42]);
        assert_eq!(parse_fuser_pids(""), Vec::<i32>::new());
        assert_eq!(parse_fuser_pids("garbage 77"), vec![77]);
    }

    #[test]
    fn test_snapshot_owners_stops_at_first_gap() {
        let (_tmp, gate) = fake_dev(3);
        let owners = gate.snapshot_owners().unwrap();
        assert_eq!(owners.len(), 3);
        assert!(owners.iter().all(|&uid| uid == Uid::current().as_raw()));
    }

    #[test]
    fn test_snapshot_owners_empty_tree() {
        let tmp = TempDir::new().unwrap();
        let gate = DevNodes::with_root(tmp.path());
        assert!(gate.snapshot_owners().unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_forces_mode_and_copies_owner() {
        let (_tmp, gate) = fake_dev(1);
        fs::set_permissions(gate.node_path(0), fs::Permissions::from_mode(0o666)).unwrap();

        let mut card = CardState::new(0, 0, "test".into(), "GPU-0".into(), 0);
        gate.reconcile(&mut card).unwrap();

        assert_eq!(card.reserved_by_uid, Uid::current().as_raw());
        let (_, mode) = gate.owner_and_mode(0).unwrap();
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_owner_and_mode_missing_node() {
        let tmp = TempDir::new().unwrap();
        let gate = DevNodes::with_root(tmp.path());
        assert!(gate.owner_and_mode(0).is_err());
    }

    // chown to foreign uids needs privilege; these cover the real transitions.

    #[test]
    fn test_admit_and_revoke_move_ownership() {
        if !Uid::effective().is_root() {
            eprintln!("Skipping test_admit_and_revoke_move_ownership: requires root");
            return;
        }

        let (_tmp, gate) = fake_dev(1);
        let mut card = CardState::new(0, 0, "test".into(), "GPU-0".into(), 0);

        gate.admit(&mut card, 1001, 42, 7).unwrap();
        assert_eq!(card.reserved_by_uid, 1001);
        assert_eq!(card.client_pids, vec![42]);
        assert_eq!(card.last_used, 7);
        let (uid, _) = gate.owner_and_mode(0).unwrap();
        assert_eq!(uid, 1001);

        gate.revoke(&mut card).unwrap();
        assert_eq!(card.reserved_by_uid, 0);
        assert!(card.client_pids.is_empty());
        assert!(card.locked_until_update);
        let (uid, _) = gate.owner_and_mode(0).unwrap();
        assert_eq!(uid, 0);
    }

    #[test]
    fn test_admit_of_root_is_a_release() {
        if !Uid::effective().is_root() {
            eprintln!("Skipping test_admit_of_root_is_a_release: requires root");
            return;
        }

        let (_tmp, gate) = fake_dev(1);
        let mut card = CardState::new(0, 0, "test".into(), "GPU-0".into(), 0);
        gate.admit(&mut card, 1001, 42, 7).unwrap();

        gate.admit(&mut card, 0, 42, 8).unwrap();
        assert_eq!(card.reserved_by_uid, 0);
        assert!(card.locked_until_update);
    }
}
