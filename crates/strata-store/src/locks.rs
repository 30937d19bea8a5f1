//! Per-path-set exclusion for materialisation.
//!
//! Each target path is guarded by a `<path>.lock` file carrying an advisory
//! exclusive `fcntl` lock. POSIX locks are per-process, so a process-wide
//! registry provides intra-process exclusion first; the fcntl lock then
//! excludes other processes. Paths are acquired in sorted order to keep
//! multi-path acquisition deadlock-free.
//!
//! Release is guaranteed on every exit path via `Drop`. A lock marked
//! "delete artifact on release" removes the guarded filesystem entry when
//! released. Ingestion arms this before materialising and disarms it after
//! a successful registration, so a failed ingestion never leaks a partial
//! artifact.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use strata_error::{Result, StrataError};
use strata_types::Interrupt;

/// Paths currently locked by this process. fcntl cannot provide
/// intra-process exclusion (locks are per-process, not per-fd), so waiters
/// queue here first.
static LOCKED_PATHS: LazyLock<(Mutex<HashSet<PathBuf>>, Condvar)> =
    LazyLock::new(|| (Mutex::new(HashSet::new()), Condvar::new()));

/// Poll interval for blocking acquisition; each wakeup honours the
/// interrupt flag.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Attempt a non-blocking POSIX advisory write lock over the whole file via
/// `fcntl(F_SETLK)`.
///
/// Returns `Ok(true)` when acquired, `Ok(false)` when another process holds
/// a conflicting lock, and `Err` for real I/O errors.
fn posix_try_lock(file: &impl AsFd) -> Result<bool> {
    let flock = libc::flock {
        l_type: libc::F_WRLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    match nix::fcntl::fcntl(
        file.as_fd().as_raw_fd(),
        nix::fcntl::FcntlArg::F_SETLK(&flock),
    ) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => Ok(false),
        Err(e) => Err(StrataError::Io(e.into())),
    }
}

/// Does the open file still name the same inode as `path`? A previous
/// holder may have deleted the lock file between our open and our acquire.
fn same_inode(file: &File, path: &Path) -> bool {
    let Ok(fd_stat) = nix::sys::stat::fstat(file.as_raw_fd()) else {
        return false;
    };
    let Ok(path_stat) = nix::sys::stat::stat(path) else {
        return false;
    };
    fd_stat.st_ino == path_stat.st_ino && fd_stat.st_dev == path_stat.st_dev
}

fn lock_file_name(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[derive(Debug)]
struct HeldLock {
    file: File,
    lock_path: PathBuf,
    target: PathBuf,
}

/// An exclusive lock over a set of target paths.
#[derive(Debug)]
pub struct PathLocks {
    held: Vec<HeldLock>,
    delete_artifact_on_release: bool,
}

impl PathLocks {
    /// Acquire exclusive locks on every path in `targets`, blocking until
    /// all are held. Interruption releases everything acquired so far.
    pub fn lock(
        targets: impl IntoIterator<Item = PathBuf>,
        interrupt: &Interrupt,
    ) -> Result<PathLocks> {
        let mut sorted: Vec<PathBuf> = targets.into_iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut locks = PathLocks {
            held: Vec::with_capacity(sorted.len()),
            delete_artifact_on_release: false,
        };
        for target in sorted {
            // Failure drops `locks`, releasing everything acquired so far.
            let held = acquire_one(target, interrupt)?;
            locks.held.push(held);
        }
        Ok(locks)
    }

    /// Arm or disarm deletion of the guarded artifacts at release time.
    pub fn set_deletion(&mut self, delete: bool) {
        self.delete_artifact_on_release = delete;
    }
}

fn acquire_one(target: PathBuf, interrupt: &Interrupt) -> Result<HeldLock> {
    // Intra-process queue first.
    {
        let (set, condvar) = &*LOCKED_PATHS;
        let mut guard = set.lock();
        while guard.contains(&target) {
            condvar.wait_for(&mut guard, RETRY_INTERVAL);
            if let Err(e) = interrupt.check() {
                return Err(e);
            }
        }
        guard.insert(target.clone());
    }

    // From here on, failure must take the path back out of the registry.
    match acquire_fcntl(&target, interrupt) {
        Ok(held) => Ok(held),
        Err(e) => {
            release_registered(&target);
            Err(e)
        }
    }
}

fn acquire_fcntl(target: &Path, interrupt: &Interrupt) -> Result<HeldLock> {
    let lock_path = lock_file_name(target);
    loop {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StrataError::io_at(e, &lock_path))?;

        while !posix_try_lock(&file)? {
            interrupt.check()?;
            thread::sleep(RETRY_INTERVAL);
        }

        // A stale fd (lock file deleted by the previous holder) means the
        // lock we hold guards nothing; reopen and try again.
        if same_inode(&file, &lock_path) {
            debug!(path = %target.display(), "acquired path lock");
            return Ok(HeldLock {
                file,
                lock_path,
                target: target.to_owned(),
            });
        }
    }
}

fn release_registered(target: &Path) {
    let (set, condvar) = &*LOCKED_PATHS;
    let mut guard = set.lock();
    guard.remove(target);
    condvar.notify_all();
}

impl Drop for PathLocks {
    fn drop(&mut self) {
        for held in self.held.drain(..) {
            if self.delete_artifact_on_release && held.target.exists() {
                debug!(path = %held.target.display(), "deleting artifact on lock release");
                let _ = crate::ingest::delete_path(&held.target);
            }
            // Remove the lock file first so a blocked acquirer detects the
            // stale inode, then release the fcntl lock by closing the fd.
            let _ = fs::remove_file(&held.lock_path);
            drop(held.file);
            release_registered(&held.target);
        }
    }
}
