// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process Supervisor
//!
//! `fork(2)`-based worker spawning with a strict child-branch discipline.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Implements `ProcessControl` with libc
//!
//! # Child branch
//!
//! The child never unwinds into the caller's stack except by returning
//! [`Spawn::Worker`]. Everything it does before that runs under
//! `catch_unwind`; any failure writes one line to fd 2 and calls `_exit(1)`.
//!
//! Inherited descriptors above 2 are marked close-on-exec rather than closed:
//! the parent's runtime and sockets still own them, and the caller is
//! expected to leak (never drop) those objects in the worker.
//!
//! Fork from a single-threaded process only. The CLI runs the agent on a
//! current-thread runtime for this reason.

use crate::domain::errors::{PopError, PopResult};
use crate::domain::process::{ProcessControl, Spawn};
use std::collections::BTreeSet;
use std::io::Write;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

/// Spawns workers by duplicating the current process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    uid: Option<u32>,
    gid: Option<u32>,
    preserve: BTreeSet<RawFd>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop workers to `uid`/`gid` after spawning. Requires root.
    pub fn with_privileges(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Keep `fd` open across a later `exec` in the worker.
    pub fn preserve_fd(mut self, fd: RawFd) -> Self {
        self.preserve.insert(fd);
        self
    }

    fn changes_privileges(&self) -> bool {
        self.uid.is_some() || self.gid.is_some()
    }

    /// Runs in the child only, so it must not allocate: another thread of
    /// the parent may have held the allocator lock at `fork`. `fds` is the
    /// descriptor table listed before forking; `ids` is the (uid, gid) to
    /// drop to.
    fn prepare_worker(
        &self,
        fds: &[RawFd],
        ids: Option<(libc::uid_t, libc::gid_t)>,
    ) -> Result<(), &'static str> {
        // Detach any installed reporting hook. Leaked, since freeing it
        // would take the allocator lock.
        std::mem::forget(panic::take_hook());

        for &fd in fds {
            if fd <= 2 || self.preserve.contains(&fd) {
                continue;
            }
            // SAFETY: fcntl on an arbitrary descriptor number; EBADF is
            // harmless and ignored.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags >= 0 {
                    libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
                }
            }
        }

        if let Some((uid, gid)) = ids {
            // Supplementary groups and group first, while still privileged.
            // SAFETY: plain syscalls; a null list with length 0 is allowed.
            if unsafe { libc::setgroups(0, std::ptr::null()) } != 0 {
                return Err("setgroups");
            }
            if unsafe { libc::setgid(gid) } != 0 {
                return Err("setgid");
            }
            if unsafe { libc::setuid(uid) } != 0 {
                return Err("setuid");
            }
        }
        Ok(())
    }
}

impl ProcessControl for ProcessSupervisor {
    fn spawn(&self, service: &str) -> PopResult<Spawn> {
        // Buffered output would otherwise be emitted by both processes.
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        let saved = if self.changes_privileges() {
            Some(SavedIds::capture_and_elevate()?)
        } else {
            None
        };
        // Unset ids default to the caller's effective ones.
        let ids = saved.as_ref().map(|s| {
            (
                self.uid.map_or(s.euid, |u| u as libc::uid_t),
                self.gid.map_or(s.egid, |g| g as libc::gid_t),
            )
        });

        // Everything the child needs is allocated up front.
        let fds = open_descriptors();
        let worker = Spawn::Worker {
            service: service.to_string(),
        };

        // SAFETY: the child branch below only runs `prepare_worker` under
        // catch_unwind and either returns `Spawn::Worker` or `_exit`s.
        let pid = unsafe { libc::fork() };

        if pid != 0 {
            let fork_error = (pid < 0).then(std::io::Error::last_os_error);
            if let Some(saved) = saved {
                saved.restore();
            }
            if let Some(err) = fork_error {
                return Err(PopError::Process(format!("fork failed: {err}")));
            }
            debug!(service, pid, "Forked worker");
            return Ok(Spawn::Parent { pid: pid as u32 });
        }

        match panic::catch_unwind(AssertUnwindSafe(|| self.prepare_worker(&fds, ids))) {
            Ok(Ok(())) => Ok(worker),
            Ok(Err(call)) => child_exit(call),
            Err(_) => child_exit("panic"),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let pid = pid as libc::pid_t;
        let mut status = 0;
        // SAFETY: plain syscalls on a pid.
        unsafe {
            match libc::waitpid(pid, &mut status, libc::WNOHANG) {
                0 => true,
                reaped if reaped == pid => false,
                _ => libc::kill(pid, 0) == 0 || last_errno() == libc::EPERM,
            }
        }
    }

    fn terminate(&self, pid: u32) -> PopResult<()> {
        // SAFETY: plain syscall on a pid.
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
            let err = std::io::Error::last_os_error();
            return Err(PopError::Process(format!("kill({pid}, SIGTERM): {err}")));
        }
        debug!(pid, "Sent SIGTERM");
        Ok(())
    }

    fn reap(&self, pid: u32) -> bool {
        let mut status = 0;
        // SAFETY: plain syscall on a pid.
        match unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) } {
            0 => false,
            -1 => last_errno() == libc::ECHILD,
            _ => {
                debug!(pid, status, "Reaped worker");
                true
            }
        }
    }
}

/// Real and effective ids saved around a privileged fork.
struct SavedIds {
    ruid: libc::uid_t,
    euid: libc::uid_t,
    rgid: libc::gid_t,
    egid: libc::gid_t,
}

impl SavedIds {
    fn capture_and_elevate() -> PopResult<Self> {
        // SAFETY: id getters/setters have no memory-safety preconditions.
        unsafe {
            let saved = Self {
                ruid: libc::getuid(),
                euid: libc::geteuid(),
                rgid: libc::getgid(),
                egid: libc::getegid(),
            };
            if libc::seteuid(0) != 0 || libc::setegid(0) != 0 {
                let err = std::io::Error::last_os_error();
                saved.restore();
                return Err(PopError::Process(format!(
                    "cannot regain root to change worker privileges: {err}"
                )));
            }
            Ok(saved)
        }
    }

    fn restore(&self) {
        // SAFETY: as above.
        unsafe {
            if libc::setregid(self.rgid, self.egid) != 0
                || libc::setreuid(self.ruid, self.euid) != 0
            {
                warn!(
                    error = %std::io::Error::last_os_error(),
                    "Failed to restore process ids after fork"
                );
            }
        }
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Descriptor numbers open in this process.
fn open_descriptors() -> Vec<RawFd> {
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        // The directory handle itself shows up in the listing; it is closed
        // by the time the caller looks at the numbers.
        return entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
    }
    // SAFETY: sysconf has no preconditions.
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max = if max > 0 { max.min(65_536) as RawFd } else { 1024 };
    (0..max).collect()
}

/// Report on fd 2 and terminate the child without unwinding or allocating.
fn child_exit(failed: &str) -> ! {
    const PREFIX: &str = "pop: worker setup failed: ";
    // SAFETY: write(2) to stderr and _exit(2) are async-signal-safe.
    unsafe {
        libc::write(2, PREFIX.as_ptr().cast(), PREFIX.len());
        libc::write(2, failed.as_ptr().cast(), failed.len());
        libc::write(2, b"\n".as_ptr().cast(), 1);
        libc::_exit(1)
    }
}
