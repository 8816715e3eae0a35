// SPDX-License-Identifier: Apache-2.0

//! Fixed paths and limits for the arbiter.

use std::path::PathBuf;
use std::time::Duration;

/// Clients may never hold more cards than this, regardless of how the
/// request is split across Claims.
pub const GPU_LIMIT_PER_USER: usize = 8;

const SOCKET_PATH: &str = "/var/run/nvclaim.sock";
const SENTINEL_PATH: &str = "/var/run/nvclaim_maintenance";

#[derive(Debug, Clone)]
pub struct Config {
    /// Listening endpoint. Mode 0777; authentication is SO_PEERCRED, not
    /// filesystem permissions.
    pub socket_path: PathBuf,
    /// Presence of this file switches the arbiter into maintenance mode.
    /// Content is ignored.
    pub sentinel_path: PathBuf,
    pub gpu_limit_per_user: usize,
    /// A reserved card with no driver processes and no live co-runner is
    /// reclaimed once it has been idle this long.
    pub idle_timeout_ms: u64,
    pub tick_interval: Duration,
    /// New accepts are refused above this many live connections.
    pub max_clients: usize,
    /// Connections that never issue a request are dropped after this grace.
    pub unengaged_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(SOCKET_PATH),
            sentinel_path: PathBuf::from(SENTINEL_PATH),
            gpu_limit_per_user: GPU_LIMIT_PER_USER,
            idle_timeout_ms: 60_000,
            tick_interval: Duration::from_secs(1),
            max_clients: 100,
            unengaged_grace_ms: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.socket_path, PathBuf::from("/var/run/nvclaim.sock"));
        assert_eq!(cfg.gpu_limit_per_user, 8);
        assert_eq!(cfg.idle_timeout_ms, 60_000);
        assert_eq!(cfg.tick_interval, Duration::from_secs(1));
        assert_eq!(cfg.max_clients, 100);
    }
}
