// SPDX-License-Identifier: Apache-2.0

//! The arbiter core: reservation table, admission loop and connection
//! multiplexer.
//!
//! Strictly single-threaded and event-driven. One epoll instance multiplexes
//! the listening socket, the per-client sockets and a 1 s timer; every
//! handler runs to completion between waits, so no state is shared across
//! threads and nothing needs a lock.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::kill;
use nix::sys::socket::{
    accept4, bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::card::{monotonic_ms, CardState};
use crate::config::Config;
use crate::conn::Client;
use crate::gate::DeviceGate;
use crate::probe::DeviceProbe;
use crate::protocol::{ClaimResponse, ReleaseResponse, Request, StatusResponse, MAX_REQUEST_BYTES};
use crate::queue::{new_job, JobQueue};

const OVER_LIMIT_ERROR: &str = "Your requested GPU count is over the per-user limit.";
const CAP_ERROR: &str = "GPU per-user limit is reached";
const MAINTENANCE_ERROR: &str =
    "Server is undergoing maintenance and will not accept new jobs.";

const LISTENER_TOKEN: u64 = u64::MAX;
const TIMER_TOKEN: u64 = u64::MAX - 1;

/// What the connection multiplexer should do with a client after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Close,
}

/// Signal 0 probe. EPERM still proves the process exists.
fn process_alive(pid: i32) -> bool {
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

pub struct Arbiter<P: DeviceProbe, G: DeviceGate> {
    cfg: Config,
    probe: P,
    gate: G,
    cards: Vec<CardState>,
    queue: JobQueue,
    clients: HashMap<RawFd, Client>,
    maintenance: bool,
    /// Connections scheduled for teardown at the end of the current wakeup
    /// batch. Deferred so a handler never frees a client another event in
    /// the same batch still refers to.
    dead: Vec<RawFd>,
}

impl<P: DeviceProbe, G: DeviceGate> Arbiter<P, G> {
    pub fn new(cfg: Config, probe: P, gate: G) -> Result<Self> {
        let cards: Vec<CardState> = probe
            .enumerate()
            .context("could not enumerate GPUs")?
            .into_iter()
            .map(|s| CardState::new(s.index, s.minor, s.name, s.uuid, s.mem_total))
            .collect();
        for card in &cards {
            debug!("found {card}");
        }
        info!("initialized with {} cards", cards.len());
        Ok(Self {
            cfg,
            probe,
            gate,
            cards,
            queue: JobQueue::new(),
            clients: HashMap::new(),
            maintenance: false,
            dead: Vec::new(),
        })
    }

    /// Re-apply the pre-driver-init node owners, indexed by minor. NVML init
    /// chowns every node back to root; whatever reservation existed before a
    /// restart survives it this way.
    pub fn restore_owners(&mut self, owners: &[u32]) -> Result<()> {
        for i in 0..self.cards.len() {
            let minor = self.cards[i].minor;
            if let Some(&uid) = owners.get(minor as usize) {
                self.gate
                    .restore_owner(minor, uid)
                    .with_context(|| format!("could not restore owner of card {i}"))?;
                self.cards[i].reserved_by_uid = uid;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Periodic tick (admission loop)
    // ------------------------------------------------------------------

    /// One pass of the admission loop: refresh every card from the driver
    /// and the filesystem, reap abandoned reservations, refresh the
    /// maintenance flag, then drain the queue while the head is satisfiable.
    pub fn tick(&mut self) {
        let now = monotonic_ms();
        self.refresh_cards(now);
        self.maintenance = self.cfg.sentinel_path.exists();
        self.sweep_unengaged(now);
        self.drain_queue(now);
    }

    fn refresh_cards(&mut self, now: u64) {
        for i in 0..self.cards.len() {
            if !self.refresh_card(i) {
                continue;
            }

            let card = &mut self.cards[i];
            if !card.processes.is_empty() {
                card.last_used = now;
            }

            // No driver context: a reservation only stays alive through its
            // co-runners. Entries for dead processes are dropped here.
            if card.processes.is_empty() && !card.client_pids.is_empty() {
                card.client_pids.retain(|&pid| process_alive(pid));
                if card.client_pids.is_empty() && card.reserved_by_uid != 0 {
                    info!("returning card {}, no client is attached anymore", i);
                    self.revoke_card(i);
                }
            }

            let card = &self.cards[i];
            if card.reserved_by_uid != 0
                && now.saturating_sub(card.last_used) > self.cfg.idle_timeout_ms
            {
                info!("returning card {}, no usage for a long time", i);
                self.revoke_card(i);
            }
        }
    }

    /// Sample one card and reconcile it against the filesystem. On failure
    /// the card goes stale: it keeps its previous telemetry and drops out of
    /// the free set until a clean sample arrives.
    fn refresh_card(&mut self, i: usize) -> bool {
        let index = self.cards[i].index;
        let sample = match self.probe.sample(index) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("could not sample card {index}: {e:#}");
                self.cards[i].stale = true;
                return false;
            }
        };

        {
            let card = &mut self.cards[i];
            card.compute_pct = sample.compute_pct;
            card.mem_total = sample.mem_total;
            card.mem_used = sample.mem_used;
            card.temp_c = sample.temp_c;
            card.processes = sample.processes;
            card.stale = false;
            card.locked_until_update = false;
        }

        if let Err(e) = self.gate.reconcile(&mut self.cards[i]) {
            warn!("could not reconcile card {index}: {e:#}");
            self.cards[i].stale = true;
            return false;
        }
        true
    }

    /// A revoke that cannot reach the filesystem leaves a node owned by a
    /// user the arbiter thinks is gone. Exit and restart clean.
    fn revoke_card(&mut self, i: usize) {
        if let Err(e) = self.gate.revoke(&mut self.cards[i]) {
            error!("device gate failure: {e:#}");
            std::process::exit(1);
        }
    }

    /// Connections that never sent a request are dropped after a short
    /// grace; everything else lives until the peer closes.
    fn sweep_unengaged(&mut self, now: u64) {
        for (&fd, client) in &self.clients {
            if !client.engaged
                && now.saturating_sub(client.connected_at) > self.cfg.unengaged_grace_ms
            {
                debug!("dropping unengaged client {} (uid {})", client.pid, client.uid);
                self.dead.push(fd);
            }
        }
    }

    fn drain_queue(&mut self, now: u64) {
        loop {
            let Some(job) = self.queue.front().cloned() else {
                break;
            };
            // A queued job always has a live connection: enqueue requires
            // one and disconnect removes the job.
            let Some(fd) = self.client_fd_by_pid(job.pid) else {
                panic!("job without client (pid {})", job.pid);
            };

            if self.maintenance {
                info!("sending maintenance notice to client {}", job.pid);
                self.deny_and_close(fd, MAINTENANCE_ERROR);
                self.queue.pop_front();
                continue;
            }

            let held = self
                .cards
                .iter()
                .filter(|c| c.reserved_by_uid == job.uid)
                .count();
            if held + job.num_gpus as usize > self.cfg.gpu_limit_per_user {
                info!("per-user limit reached for uid {}", job.uid);
                self.deny_and_close(fd, CAP_ERROR);
                self.queue.pop_front();
                continue;
            }

            // Free cards in increasing index order; packing is
            // leftmost-first and never reorders.
            let free: Vec<usize> = self
                .cards
                .iter()
                .enumerate()
                .filter(|(_, c)| c.assignable())
                .map(|(i, _)| i)
                .collect();
            if (job.num_gpus as usize) > free.len() {
                break; // head blocks, no bypass
            }

            info!("starting job of client {} ({} cards)", job.pid, job.num_gpus);
            let mut claimed = Vec::with_capacity(job.num_gpus as usize);
            for &i in free.iter().take(job.num_gpus as usize) {
                if let Err(e) = self.gate.admit(&mut self.cards[i], job.uid, job.pid, now) {
                    error!("device gate failure: {e:#}");
                    std::process::exit(1);
                }
                claimed.push(self.cards[i].to_wire());
            }
            if let Some(client) = self.clients.get_mut(&fd) {
                client.waiting = false;
                client.send_response(&ClaimResponse::granted(claimed));
            }
            self.queue.pop_front();
        }
    }

    fn deny_and_close(&mut self, fd: RawFd, msg: &str) {
        if let Some(client) = self.clients.get_mut(&fd) {
            client.waiting = false;
            client.send_response(&ClaimResponse::denied(msg));
        }
        self.dead.push(fd);
    }

    fn client_fd_by_pid(&self, pid: i32) -> Option<RawFd> {
        self.clients
            .iter()
            .find(|(_, c)| c.pid == pid)
            .map(|(&fd, _)| fd)
    }

    // ------------------------------------------------------------------
    // Request dispatch
    // ------------------------------------------------------------------

    pub fn handle_request(&mut self, fd: RawFd, req: Request) -> Disposition {
        let Some((uid, pid)) = self.clients.get(&fd).map(|c| (c.uid, c.pid)) else {
            return Disposition::Close;
        };

        match req {
            Request::Status => {
                let resp = self.status_snapshot();
                if let Some(client) = self.clients.get(&fd) {
                    client.send_response(&resp);
                }
                Disposition::Keep
            }
            Request::Claim { num_gpus, wait: _ } => {
                if num_gpus as usize > self.cfg.gpu_limit_per_user {
                    if let Some(client) = self.clients.get(&fd) {
                        client.send_response(&ClaimResponse::denied(OVER_LIMIT_ERROR));
                    }
                    return Disposition::Close;
                }
                self.queue.enqueue(new_job(uid, pid, num_gpus));
                if let Some(client) = self.clients.get_mut(&fd) {
                    client.waiting = true;
                }
                // Opportunistic admission; the reply goes out right here
                // when the queue head is already satisfiable.
                self.tick();
                Disposition::Keep
            }
            Request::CoRun { gpus } => self.handle_co_run(fd, uid, pid, &gpus),
            Request::Release { gpus } => self.handle_release(fd, uid, pid, &gpus),
        }
    }

    fn handle_co_run(&mut self, fd: RawFd, uid: u32, pid: i32, gpus: &[u32]) -> Disposition {
        for &idx in gpus {
            let error = match self.cards.get(idx as usize) {
                None => Some(format!("Invalid card index {idx}")),
                Some(card) if card.reserved_by_uid != uid => {
                    Some(format!("Card {idx} is not reserved by user"))
                }
                Some(_) => None,
            };
            if let Some(error) = error {
                if let Some(client) = self.clients.get(&fd) {
                    client.send_response(&ClaimResponse::denied(error));
                }
                return Disposition::Close;
            }
        }

        let now = monotonic_ms();
        let mut records = Vec::with_capacity(gpus.len());
        for &idx in gpus {
            let card = &mut self.cards[idx as usize];
            card.add_co_runner(pid);
            card.last_used = now;
            records.push(card.to_wire());
        }
        debug!("client {pid} now co-runs on {gpus:?}");
        if let Some(client) = self.clients.get(&fd) {
            client.send_response(&ClaimResponse::granted(records));
        }
        Disposition::Keep
    }

    fn handle_release(&mut self, fd: RawFd, uid: u32, pid: i32, gpus: &[u32]) -> Disposition {
        let mut errors = String::new();
        for &idx in gpus {
            let i = idx as usize;
            if i >= self.cards.len() {
                let _ = writeln!(errors, "Invalid card index {idx}");
                continue;
            }

            // Validate against current driver state, not the last tick's.
            self.refresh_card(i);

            let card = &mut self.cards[i];
            if card.reserved_by_uid != uid {
                let _ = writeln!(errors, "Card {idx} is not reserved by user");
                continue;
            }
            if !card.co_run_by(pid) {
                let _ = writeln!(errors, "Card {idx} is not attached to this client");
                continue;
            }
            if let Some(proc) = card.process_of(uid) {
                let _ = writeln!(
                    errors,
                    "Card {idx} is still in use. Maybe you want to kill the process with PID {}?",
                    proc.pid
                );
                continue;
            }

            card.remove_co_runner(pid);
            if card.client_pids.is_empty() && card.processes.is_empty() {
                self.revoke_card(i);
            }
        }

        if let Some(client) = self.clients.get(&fd) {
            client.send_response(&ReleaseResponse { errors });
        }
        Disposition::Keep
    }

    fn status_snapshot(&self) -> StatusResponse {
        StatusResponse {
            cards: self.cards.iter().map(CardState::to_wire).collect(),
            queue: self.queue.iter().cloned().collect(),
            maintenance: self.maintenance,
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Forget a client: cancel its queued jobs, detach it from every card
    /// and release cards it was the last co-runner of. Returns the client so
    /// the caller can unregister the fd before it is closed.
    fn drop_client(&mut self, fd: RawFd) -> Option<Client> {
        let client = self.clients.remove(&fd)?;
        debug!("closing connection to client {} (uid {})", client.pid, client.uid);
        self.queue.remove_pid(client.pid);
        for i in 0..self.cards.len() {
            let card = &mut self.cards[i];
            if !card.co_run_by(client.pid) {
                continue;
            }
            card.remove_co_runner(client.pid);
            if card.reserved_by_uid != 0
                && card.client_pids.is_empty()
                && card.processes.is_empty()
            {
                info!("returning card {}, last client disconnected", i);
                self.revoke_card(i);
            }
        }
        Some(client)
    }

    fn handle_client_ready(&mut self, fd: RawFd) {
        let mut buf = [0u8; MAX_REQUEST_BYTES];
        let (received, pid) = {
            let Some(client) = self.clients.get(&fd) else {
                return;
            };
            (client.recv_frame(&mut buf), client.pid)
        };

        match received {
            Ok(0) => self.dead.push(fd), // peer closed
            Err(e) => {
                warn!("could not read from client {pid}: {e}");
                self.dead.push(fd);
            }
            Ok(n) => match crate::protocol::decode_request(&buf[..n]) {
                Ok(req) => {
                    if let Some(client) = self.clients.get_mut(&fd) {
                        client.engaged = true;
                    }
                    if self.handle_request(fd, req) == Disposition::Close {
                        self.dead.push(fd);
                    }
                }
                Err(e) => {
                    warn!("client {pid} sent a request that could not be parsed: {e}");
                    self.dead.push(fd);
                }
            },
        }
    }

    fn accept_client(&mut self, epoll: &Epoll, listener: &OwnedFd) {
        let fd = match accept4(listener.as_raw_fd(), SockFlag::SOCK_CLOEXEC) {
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(e) => {
                error!("could not accept client: {e}");
                std::thread::sleep(std::time::Duration::from_secs(1));
                return;
            }
        };

        if self.clients.len() > self.cfg.max_clients {
            warn!("refusing connection, {} clients already active", self.clients.len());
            return; // dropping fd closes it
        }

        match Client::from_accepted(fd, monotonic_ms()) {
            Ok(client) => {
                let raw = client.raw_fd();
                if let Err(e) = epoll.add(client.fd(), EpollEvent::new(EpollFlags::EPOLLIN, raw as u64))
                {
                    error!("could not add client to epoll: {e}");
                    return;
                }
                self.clients.insert(raw, client);
            }
            Err(e) => warn!("rejecting client without credentials: {e:#}"),
        }
    }

    fn reap_dead(&mut self, epoll: &Epoll) {
        while let Some(fd) = self.dead.pop() {
            if let Some(client) = self.drop_client(fd) {
                if let Err(e) = epoll.delete(client.fd()) {
                    warn!("could not remove client from epoll: {e}");
                }
                // dropping the Client closes the socket
            }
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    pub fn run(&mut self) -> Result<()> {
        let listener = bind_socket(&self.cfg.socket_path)?;

        let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_CLOEXEC)
            .context("could not create timer fd")?;
        timer
            .set(
                // First expiry right away, then the steady tick.
                Expiration::IntervalDelayed(
                    TimeSpec::new(0, 1),
                    TimeSpec::from_duration(self.cfg.tick_interval),
                ),
                TimerSetTimeFlags::empty(),
            )
            .context("could not arm timer")?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("could not create epoll")?;
        epoll
            .add(&listener, EpollEvent::new(EpollFlags::EPOLLIN, LISTENER_TOKEN))
            .context("could not add socket to epoll")?;
        epoll
            .add(&timer, EpollEvent::new(EpollFlags::EPOLLIN, TIMER_TOKEN))
            .context("could not add timer to epoll")?;

        info!("listening on {}", self.cfg.socket_path.display());

        let mut events = [EpollEvent::empty(); 32];
        loop {
            let n = match epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("epoll_wait failed"),
            };

            for ev in &events[..n] {
                match ev.data() {
                    LISTENER_TOKEN => self.accept_client(&epoll, &listener),
                    TIMER_TOKEN => {
                        if let Err(e) = timer.wait() {
                            return Err(e).context("could not read from timer fd");
                        }
                        self.tick();
                    }
                    token => self.handle_client_ready(token as RawFd),
                }
            }

            self.reap_dead(&epoll);
        }
    }
}

/// Create the listening endpoint: seqpacket, world-connectable (the peer is
/// authenticated by SO_PEERCRED, not by socket permissions).
fn bind_socket(path: &Path) -> Result<OwnedFd> {
    let _ = fs::remove_file(path);

    let sock = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("could not open unix socket")?;

    let addr = UnixAddr::new(path)
        .with_context(|| format!("invalid socket path {}", path.display()))?;
    bind(sock.as_raw_fd(), &addr)
        .with_context(|| format!("could not bind unix socket at {}", path.display()))?;
    listen(&sock, Backlog::new(20).expect("static backlog")).context("could not listen")?;

    fs::set_permissions(path, fs::Permissions::from_mode(0o777))
        .with_context(|| format!("could not set socket permissions on {}", path.display()))?;

    Ok(sock)
}
