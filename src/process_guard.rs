//! Child process lifecycle
//!
//! Every external tool (`parted`, `mkfs.*`, `pacman` inside the chroot) is
//! started in its own process group and recorded in a global registry. If the
//! installer receives SIGINT/SIGTERM/SIGHUP, or the `CleanupGuard` in `main`
//! is dropped, the registered groups get SIGTERM, a grace period, then SIGKILL.
//! Children also carry a parent-death signal so a crashed installer never
//! leaves a half-finished `mkfs` running against the target drive.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Process groups of running external tools
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    /// Set once termination started so a second signal doesn't repeat it
    terminating: bool,
}

impl ChildRegistry {
    /// Shared registry used by `SystemRunner`
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!(pid, "tracking child process");
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!(pid, "child process finished");
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// SIGTERM every tracked group, wait up to `grace`, SIGKILL the rest
    pub fn terminate_all(&mut self, grace: Duration) {
        if self.terminating {
            return;
        }
        self.terminating = true;

        if self.pids.is_empty() {
            return;
        }

        let pids: Vec<u32> = self.pids.iter().copied().collect();
        info!("Stopping {} running tool(s)", pids.len());

        for &pid in &pids {
            signal_group_or_process(pid, Signal::SIGTERM);
        }

        let started = Instant::now();
        while started.elapsed() < grace {
            if pids.iter().all(|&pid| !is_alive(pid)) {
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in pids.iter().filter(|&&pid| is_alive(pid)) {
            warn!(pid, "tool ignored SIGTERM, sending SIGKILL");
            signal_group_or_process(pid, Signal::SIGKILL);
        }
        self.pids.clear();
    }
}

/// Signal the whole group (negative pid); fall back to the leader alone
fn signal_group_or_process(pid: u32, sig: Signal) {
    let raw = pid as i32;
    if let Err(group_err) = signal::kill(Pid::from_raw(-raw), sig) {
        if let Err(err) = signal::kill(Pid::from_raw(raw), sig) {
            debug!(pid, %group_err, %err, "could not deliver {:?}", sig);
        }
    }
}

/// Alive means the pid exists and is not a zombie
fn is_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map(|state| !matches!(state, "Z" | "X"))
            .unwrap_or(true),
        Err(_) => true,
    }
}

/// Terminates registered children when dropped.
///
/// Held by `main` for the lifetime of the process so an early return or a
/// propagated error still cleans up.
pub struct CleanupGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl CleanupGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }
}

impl Default for CleanupGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(Duration::from_secs(5));
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handling on a background thread.
///
/// On delivery the registered children are stopped and the process exits
/// with `128 + signal`.
pub fn init_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::Builder::new()
        .name("signal-cleanup".into())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                warn!("Received signal {}, stopping running tools", sig);
                if let Ok(mut registry) = ChildRegistry::global().lock() {
                    registry.terminate_all(Duration::from_secs(3));
                }
                std::process::exit(128 + sig);
            }
        })?;
    Ok(())
}

/// Extension for `std::process::Command`: run the child as leader of a new
/// process group with a parent-death signal.
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls (setpgid, prctl) run between fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::from)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}
