// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host-side plumbing shared by the benchmark crates: host command
//! execution, run-scoped cancellation, SSH sessions to guests and child
//! process teardown.

pub mod cancel;
pub mod host;
pub mod ssh;

use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::Child;
use std::time::Duration;
use std::{fs, io};

use log::{debug, warn};
use wait_timeout::ChildExt;

pub use cancel::CancelToken;
pub use host::{command_line, HostCommandError, HostExec, SystemExec};
pub use ssh::{
    Connector, PasswordAuth, PasswordConnector, RemoteSession, SshCommandError, SshEndpoint,
    SshSession,
};

/// Time a child gets to exit after SIGTERM before it is killed.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

/// Stops a child spawned as the leader of its own process group.
///
/// The whole group receives SIGTERM first so that helpers forked by the
/// child go away with it. If the child is still around after `grace` it is
/// killed. The child is always reaped before returning.
pub fn kill_child(child: &mut Child, grace: Duration) -> io::Result<()> {
    let pgid = child.id() as i32;
    // SAFETY: kill() takes no pointers; a stale group id only yields ESRCH.
    let r = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if r != 0 {
        let e = io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ESRCH) {
            warn!("Failed to send SIGTERM to process group {pgid}: {e}");
        }
    }

    // The timeout period elapsed without the child exiting
    if child.wait_timeout(grace)?.is_none() {
        debug!("Process {pgid} ignored SIGTERM, killing it");
        let _ = child.kill();
        child.wait()?;
    }

    Ok(())
}

/// Free space, in bytes, of the filesystem holding `path`.
pub fn free_space(path: &Path) -> io::Result<u64> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stats = std::mem::MaybeUninit::<libc::statvfs>::zeroed();
    // SAFETY: c_path is a valid NUL terminated string and stats points to
    // writable memory large enough for a statvfs.
    let r = unsafe { libc::statvfs(c_path.as_ptr(), stats.as_mut_ptr()) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: statvfs() returned 0, so it filled in the whole struct.
    let stats = unsafe { stats.assume_init() };

    Ok(stats.f_bavail as u64 * stats.f_frsize as u64)
}

/// Copies a (large) disk image, waiting for disk space to come back when the
/// destination filesystem is full.
///
/// Gives up after `retries` attempts or as soon as `cancel` fires.
pub fn rate_limited_copy<P: AsRef<Path>, Q: AsRef<Path>>(
    from: P,
    to: Q,
    cancel: &CancelToken,
    retries: u32,
    retry_delay: Duration,
) -> io::Result<u64> {
    let from = from.as_ref();
    let to = to.as_ref();
    let needed = fs::metadata(from)?.len();
    let dest_dir = to.parent().unwrap_or_else(|| Path::new("."));

    for i in 0..retries {
        let available = free_space(dest_dir)?;
        if available < needed {
            warn!(
                "Not enough space in {} ({available} < {needed}). Attempt {i} of {retries}.",
                dest_dir.display()
            );
            if !cancel.sleep(retry_delay) {
                break;
            }
            continue;
        }

        match fs::copy(from, to) {
            Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                warn!("Copy returned ENOSPC. Attempt {i} of {retries}.");
                let _ = fs::remove_file(to);
                if !cancel.sleep(retry_delay) {
                    break;
                }
            }
            r => return r,
        }
    }

    Err(io::Error::other(format!(
        "could not copy {} to {}",
        from.display(),
        to.display()
    )))
}
