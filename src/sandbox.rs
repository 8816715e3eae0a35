// SPDX-License-Identifier: Apache-2.0

//! Namespace sandbox for user commands.
//!
//! The helper is installed setuid root. It builds a private mount namespace
//! whose `/dev` is an overlay hiding the device nodes the caller was not
//! granted, plus a fresh PID namespace with a minimal pid-1 reaper, then
//! drops every privilege before the user command runs. Hide-list entries are
//! plain file names; no user-controlled path is ever traversed.

use anyhow::{anyhow, bail, Context, Result};
use log::warn;
use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl::set_pdeathsig;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::{self, makedev, Mode, SFlag};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
    execvp, fork, getppid, setgroups, setresgid, setresuid, ForkResult, Gid, Pid, Uid,
};
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

/// Scratch mount point for the overlay upper/work directories.
const SCRATCH: &str = "/tmp/nvclaim_sandbox";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxArgs {
    /// `/dev` entries to hide from the command.
    pub hide: Vec<String>,
    /// The command and its arguments.
    pub command: Vec<String>,
}

/// Split `<hide...> -- <cmd> [args]` and validate the hide list.
pub fn parse_args(args: &[String]) -> Result<SandboxArgs> {
    let sep = args
        .iter()
        .position(|a| a == "--")
        .context("missing \"--\" separator")?;
    let hide = args[..sep].to_vec();
    let command = args[sep + 1..].to_vec();
    if command.is_empty() {
        bail!("no command given after \"--\"");
    }
    for name in &hide {
        if !is_valid_device_name(name) {
            bail!("invalid device name {name:?}");
        }
    }
    Ok(SandboxArgs { hide, command })
}

/// Hide-list entries name files directly under /dev. Anything that could
/// escape the directory is rejected outright.
fn is_valid_device_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// The loader strips sensitive variables from a setuid environment. The
/// invoking parent still has them, so they are snapshotted from its `/proc`
/// entry and restored in the child after privileges are gone.
pub fn parent_env_snapshot(proc_root: &Path, ppid: Pid) -> Result<Vec<(String, String)>> {
    let path = proc_root.join(ppid.as_raw().to_string()).join("environ");
    let bytes =
        fs::read(&path).with_context(|| format!("could not read {}", path.display()))?;
    Ok(parse_environ(&bytes))
}

/// Parse a NUL-separated environ block. Malformed or non-UTF-8 entries are
/// skipped.
pub fn parse_environ(bytes: &[u8]) -> Vec<(String, String)> {
    bytes
        .split(|&b| b == 0)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let entry = std::str::from_utf8(entry).ok()?;
            let (key, value) = entry.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_owned(), value.to_owned()))
        })
        .collect()
}

/// Set every variable from the snapshot that the loader stripped. Variables
/// that survived keep their current value.
fn rehydrate_env(snapshot: &[(String, String)]) {
    for (key, value) in snapshot {
        if std::env::var_os(key).is_none() {
            std::env::set_var(key, value);
        }
    }
}

/// Run the command inside the sandbox and return its exit code.
pub fn run(args: &SandboxArgs) -> Result<i32> {
    if !Uid::effective().is_root() {
        bail!("nvclaim-sandbox must be installed setuid root");
    }

    // Die with the invoking parent rather than outliving it.
    set_pdeathsig(Signal::SIGTERM).context("could not set parent-death signal")?;

    let env = parent_env_snapshot(Path::new("/proc"), getppid())
        .context("could not snapshot parent environment")?;

    unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID)
        .context("could not create mount+pid namespaces")?;
    setup_dev_overlay(&args.hide)?;

    match unsafe { fork() }.context("could not fork namespace parent")? {
        ForkResult::Child => {
            // pid 1 of the new namespace.
            let code = match namespace_parent(args, &env) {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("nvclaim-sandbox: {e:#}");
                    1
                }
            };
            std::process::exit(code);
        }
        ForkResult::Parent { child } => {
            drop_privileges()?;
            wait_for(child)
        }
    }
}

/// Build the restricted `/dev`: a tmpfs-backed overlay whose upper layer
/// carries one 0:0 character node per hidden name, which overlayfs treats as
/// a whiteout.
fn setup_dev_overlay(hide: &[String]) -> Result<()> {
    // Keep every mount we make invisible to the rest of the system.
    mount_fs(
        None,
        Path::new("/"),
        None,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None,
    )
    .context("could not make mounts private")?;

    let scratch = PathBuf::from(SCRATCH);
    fs::create_dir_all(&scratch)
        .with_context(|| format!("could not create {}", scratch.display()))?;
    mount_fs(Some("tmpfs"), &scratch, Some("tmpfs"), MsFlags::empty(), None)?;

    let upper = scratch.join("upper");
    let workdir = scratch.join("workdir");
    let pts_hold = scratch.join("pts");
    for dir in [&upper, &workdir, &pts_hold] {
        fs::create_dir(dir).with_context(|| format!("could not create {}", dir.display()))?;
    }

    for name in hide {
        whiteout(&upper.join(name))?;
    }

    // The pseudo-terminal mount must survive the overlay, or the command
    // loses its controlling terminal.
    mount_fs(Some("/dev/pts"), &pts_hold, None, MsFlags::MS_MOVE, None)
        .context("could not move /dev/pts aside")?;

    let data = format!(
        "lowerdir=/dev,upperdir={},workdir={}",
        upper.display(),
        workdir.display()
    );
    mount_fs(
        Some("overlay"),
        Path::new("/dev"),
        Some("overlay"),
        MsFlags::empty(),
        Some(&data),
    )
    .context("could not create /dev overlay")?;

    mount_fs(
        Some(pts_hold.to_str().expect("scratch path is utf-8")),
        Path::new("/dev/pts"),
        None,
        MsFlags::MS_MOVE,
        None,
    )
    .context("could not move /dev/pts back")?;

    mount_fs(
        Some("tmpfs"),
        Path::new("/dev/shm"),
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=1777"),
    )
    .context("could not mount fresh /dev/shm")?;

    Ok(())
}

fn mount_fs(
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    mount(source, target, fstype, flags, data).with_context(|| {
        format!(
            "could not mount {} on {}",
            source.unwrap_or("none"),
            target.display()
        )
    })
}

/// Create a 0:0 character node, ignoring the umask so overlayfs sees the
/// exact whiteout it expects.
fn whiteout(path: &Path) -> Result<()> {
    let old_umask = stat::umask(Mode::empty());
    let result = stat::mknod(
        path,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o666),
        makedev(0, 0),
    );
    stat::umask(old_umask);
    result.with_context(|| format!("could not create whiteout {}", path.display()))
}

/// The first process in the new PID namespace. Remounts /proc (the inherited
/// one shows the old namespace), sheds privileges, starts the user command
/// and reaps orphans until it exits.
fn namespace_parent(args: &SandboxArgs, env: &[(String, String)]) -> Result<i32> {
    mount_fs(
        Some("proc"),
        Path::new("/proc"),
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None,
    )
    .context("could not remount /proc")?;

    drop_privileges()?;
    // Changing uids cleared the parent-death signal; arm it again.
    set_pdeathsig(Signal::SIGTERM).context("could not re-arm parent-death signal")?;

    match unsafe { fork() }.context("could not fork user command")? {
        ForkResult::Child => {
            rehydrate_env(env);
            let e = exec(&args.command);
            eprintln!("nvclaim-sandbox: {e:#}");
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            USER_CHILD.store(child.as_raw(), Ordering::SeqCst);
            install_forwarders()?;
            reap_until(child)
        }
    }
}

static USER_CHILD: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal(sig: i32) {
    let pid = USER_CHILD.load(Ordering::SeqCst);
    if pid > 0 {
        if let Ok(signal) = Signal::try_from(sig) {
            let _ = kill(Pid::from_raw(pid), signal);
        }
    }
}

/// Interrupts aimed at the reaper are passed down to the user process.
fn install_forwarders() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("could not install {signal} forwarder"))?;
    }
    Ok(())
}

/// Reap everything reparented to pid 1 until the user process itself exits.
fn reap_until(target: Pid) -> Result<i32> {
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) if pid == target => return Ok(code),
            Ok(WaitStatus::Signaled(pid, signal, _)) if pid == target => {
                return Ok(128 + signal as i32)
            }
            Ok(_) => continue, // reaped an orphan
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => bail!("user process vanished without a wait status"),
            Err(e) => return Err(e).context("could not wait for user process"),
        }
    }
}

fn wait_for(child: Pid) -> Result<i32> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("could not wait for sandbox child"),
        }
    }
}

/// Shed the setuid privilege completely: supplementary groups, then gid,
/// then uid, all set to the caller's real ids.
fn drop_privileges() -> Result<()> {
    let uid = Uid::current();
    let gid = Gid::current();
    if Uid::effective().is_root() && !uid.is_root() {
        setgroups(&[gid]).context("could not drop supplementary groups")?;
    }
    setresgid(gid, gid, gid).context("could not drop gid")?;
    setresuid(uid, uid, uid).context("could not drop uid")?;
    Ok(())
}

fn exec(command: &[String]) -> anyhow::Error {
    let program = match CString::new(command[0].as_str()) {
        Ok(program) => program,
        Err(_) => return anyhow!("command contains a NUL byte"),
    };
    let argv: Result<Vec<CString>> = command
        .iter()
        .map(|a| CString::new(a.as_str()).map_err(|_| anyhow!("argument contains a NUL byte")))
        .collect();
    let argv = match argv {
        Ok(argv) => argv,
        Err(e) => return e,
    };

    match execvp(&program, &argv) {
        Ok(infallible) => match infallible {},
        Err(e) => {
            if e == Errno::ENOENT {
                warn!("{} not found in PATH", command[0]);
            }
            anyhow!("could not exec {}: {e}", command[0])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;
    use serial_test::serial;
    use std::os::unix::fs::FileTypeExt;
    use tempfile::TempDir;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args_splits_hide_list_and_command() {
        let parsed =
            parse_args(&strings(&["nvidia1", "nvidia2", "--", "python3", "train.py"])).unwrap();
        assert_eq!(parsed.hide, vec!["nvidia1", "nvidia2"]);
        assert_eq!(parsed.command, vec!["python3", "train.py"]);
    }

    #[test]
    fn test_parse_args_allows_empty_hide_list() {
        let parsed = parse_args(&strings(&["--", "true"])).unwrap();
        assert!(parsed.hide.is_empty());
        assert_eq!(parsed.command, vec!["true"]);
    }

    #[test]
    fn test_parse_args_requires_separator() {
        assert!(parse_args(&strings(&["nvidia1", "true"])).is_err());
    }

    #[test]
    fn test_parse_args_requires_a_command() {
        assert!(parse_args(&strings(&["nvidia1", "--"])).is_err());
    }

    #[test]
    fn test_parse_args_rejects_path_escapes() {
        assert!(parse_args(&strings(&["../etc/passwd", "--", "true"])).is_err());
        assert!(parse_args(&strings(&["sub/dir", "--", "true"])).is_err());
        assert!(parse_args(&strings(&["", "--", "true"])).is_err());
    }

    #[test]
    fn test_is_valid_device_name() {
        assert!(is_valid_device_name("nvidia0"));
        assert!(is_valid_device_name("nvidia-uvm"));
        assert!(is_valid_device_name("nvidia_modeset"));
        assert!(!is_valid_device_name("nvidia/0"));
        assert!(!is_valid_device_name(".."));
        assert!(!is_valid_device_name(""));
        assert!(!is_valid_device_name(&"x".repeat(65)));
    }

    #[test]
    fn test_parse_environ() {
        let block = b"PATH=/usr/bin\0HOME=/home/alice\0EMPTY=\0";
        let env = parse_environ(block);
        assert_eq!(
            env,
            vec![
                ("PATH".to_string(), "/usr/bin".to_string()),
                ("HOME".to_string(), "/home/alice".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_parse_environ_skips_malformed_entries() {
        let block = b"NOEQUALS\0=novalue\0OK=1\0\xff\xfe=bad\0";
        let env = parse_environ(block);
        assert_eq!(env, vec![("OK".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_parse_environ_empty() {
        assert!(parse_environ(b"").is_empty());
        assert!(parse_environ(b"\0\0").is_empty());
    }

    #[test]
    fn test_parent_env_snapshot_reads_proc_layout() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("1234");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("environ"), b"CUDA_VISIBLE_DEVICES=GPU-abc\0").unwrap();

        let env = parent_env_snapshot(tmp.path(), Pid::from_raw(1234)).unwrap();
        assert_eq!(env[0].0, "CUDA_VISIBLE_DEVICES");
        assert_eq!(env[0].1, "GPU-abc");
    }

    #[test]
    fn test_parent_env_snapshot_missing_process() {
        let tmp = TempDir::new().unwrap();
        assert!(parent_env_snapshot(tmp.path(), Pid::from_raw(99)).is_err());
    }

    #[test]
    #[serial]
    fn test_rehydrate_env_only_fills_gaps() {
        std::env::remove_var("NVCLAIM_TEST_MISSING");
        std::env::set_var("NVCLAIM_TEST_PRESENT", "kept");

        rehydrate_env(&[
            ("NVCLAIM_TEST_MISSING".into(), "restored".into()),
            ("NVCLAIM_TEST_PRESENT".into(), "clobbered".into()),
        ]);

        assert_eq!(std::env::var("NVCLAIM_TEST_MISSING").unwrap(), "restored");
        assert_eq!(std::env::var("NVCLAIM_TEST_PRESENT").unwrap(), "kept");

        std::env::remove_var("NVCLAIM_TEST_MISSING");
        std::env::remove_var("NVCLAIM_TEST_PRESENT");
    }

    #[test]
    fn test_whiteout_creates_char_zero_node() {
        if !Uid::effective().is_root() {
            eprintln!("Skipping test_whiteout_creates_char_zero_node: requires root");
            return;
        }

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nvidia1");
        if let Err(e) = whiteout(&path) {
            // Containerised runners may withhold CAP_MKNOD even from root.
            eprintln!("Skipping test_whiteout_creates_char_zero_node: {e:#}");
            return;
        }

        let meta = fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_char_device());
        use std::os::unix::fs::MetadataExt;
        assert_eq!(meta.rdev(), 0);
    }

    #[test]
    fn test_run_refuses_without_privilege() {
        if Uid::effective().is_root() {
            eprintln!("Skipping test_run_refuses_without_privilege: running as root");
            return;
        }
        let args = parse_args(&strings(&["nvidia0", "--", "true"])).unwrap();
        let err = run(&args).unwrap_err();
        assert!(err.to_string().contains("setuid"));
    }
}
