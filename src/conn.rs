// SPDX-License-Identifier: Apache-2.0

//! One accepted client connection.
//!
//! Peer identity comes from the kernel's socket credentials at accept time
//! and is never taken from request payloads. The socket is SOCK_SEQPACKET:
//! one request frame in, one response frame out.

use anyhow::{Context, Result};
use log::warn;
use nix::sys::socket::{getsockopt, recv, send, sockopt, MsgFlags};
use serde::Serialize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::protocol;

#[derive(Debug)]
pub struct Client {
    fd: OwnedFd,
    pub uid: u32,
    pub pid: i32,
    /// Monotonic ms at accept.
    pub connected_at: u64,
    /// A Claim is in the queue and the reply is still owed.
    pub waiting: bool,
    /// The connection has issued at least one request; unengaged connections
    /// are swept after a short grace period.
    pub engaged: bool,
}

impl Client {
    pub fn from_accepted(fd: OwnedFd, now: u64) -> Result<Self> {
        let cred =
            getsockopt(&fd, sockopt::PeerCredentials).context("could not read SO_PEERCRED")?;
        Ok(Self {
            fd,
            uid: cred.uid(),
            pid: cred.pid(),
            connected_at: now,
            waiting: false,
            engaged: false,
        })
    }

    /// Test-only: a connection with a scripted identity.
    #[cfg(test)]
    pub(crate) fn with_identity(fd: OwnedFd, uid: u32, pid: i32, now: u64) -> Self {
        Self {
            fd,
            uid,
            pid,
            connected_at: now,
            waiting: false,
            engaged: false,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Read one request frame. Returns 0 when the peer has closed.
    pub fn recv_frame(&self, buf: &mut [u8]) -> nix::Result<usize> {
        recv(self.raw_fd(), buf, MsgFlags::empty())
    }

    /// Encode and send one response frame. Send failures are logged, not
    /// propagated: a vanished peer is handled as a disconnect, nothing more.
    pub fn send_response<T: Serialize>(&self, msg: &T) {
        let data = match protocol::encode(msg) {
            Ok(data) => data,
            Err(e) => {
                warn!("could not encode response for client {}: {e}", self.pid);
                return;
            }
        };
        // MSG_NOSIGNAL: a peer that vanished between request and reply must
        // not take the arbiter down with SIGPIPE.
        match send(
            self.raw_fd(),
            &data,
            MsgFlags::MSG_EOR | MsgFlags::MSG_NOSIGNAL,
        ) {
            Ok(n) if n == data.len() => {}
            Ok(n) => warn!(
                "short send to client {}: {n} of {} bytes",
                self.pid,
                data.len()
            ),
            Err(e) => warn!("could not send response to client {}: {e}", self.pid),
        }
    }
}
