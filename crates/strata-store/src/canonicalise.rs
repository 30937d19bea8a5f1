//! Metadata canonicalisation.
//!
//! After materialisation every path is normalised so that on-disk contents
//! are bit-identical regardless of who produced them: ownership moves to the
//! effective uid (`lchown` so symlinks are covered), modes collapse to
//! `0444`/`0555` preserving only the owner-exec bit, and mtimes drop to zero
//! with atimes preserved. Symlinks are skipped for chmod/utime; their modes
//! and times are not meaningful.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::sys::stat::{lstat, utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::geteuid;

use strata_error::{Result, StrataError};
use strata_types::Interrupt;

/// `lchown` to the given uid, leaving the group untouched.
fn lchown_to(path: &Path, uid: libc::uid_t) -> io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::other("path contains an interior NUL byte"))?;
    let rc = unsafe { libc::lchown(cpath.as_ptr(), uid, u32::MAX as libc::gid_t) };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn canonicalise_node(path: &Path, interrupt: &Interrupt) -> Result<()> {
    interrupt.check()?;

    let st = lstat(path).map_err(|e| StrataError::io_at(e.into(), path))?;
    let is_symlink = (st.st_mode & libc::S_IFMT) == libc::S_IFLNK;
    let euid = geteuid().as_raw();

    if st.st_uid != euid {
        lchown_to(path, euid).map_err(|e| StrataError::io_at(e, path))?;
    }

    if !is_symlink {
        // Mask the type bits; anything but the two canonical modes collapses
        // to read-only, keeping only the owner-exec bit.
        let mode = st.st_mode & !libc::S_IFMT;
        if mode != 0o444 && mode != 0o555 {
            let new_mode = 0o444 | if st.st_mode & libc::S_IXUSR != 0 { 0o111 } else { 0 };
            fs::set_permissions(path, fs::Permissions::from_mode(new_mode))
                .map_err(|e| StrataError::io_at(e, path))?;
        }

        if st.st_mtime != 0 {
            let atime = TimeSpec::new(st.st_atime, st.st_atime_nsec);
            let mtime = TimeSpec::new(0, 0);
            utimensat(
                None,
                path,
                &atime,
                &mtime,
                UtimensatFlags::NoFollowSymlink,
            )
            .map_err(|e| StrataError::io_at(e.into(), path))?;
        }
    }

    if (st.st_mode & libc::S_IFMT) == libc::S_IFDIR {
        let mut names: Vec<_> = fs::read_dir(path)
            .map_err(|e| StrataError::io_at(e, path))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name())
            .collect();
        names.sort();
        for name in names {
            canonicalise_node(&path.join(name), interrupt)?;
        }
    }
    Ok(())
}

/// Canonicalise `path` recursively, then verify the top level really is
/// owned by the effective uid.
pub fn canonicalise_path_meta_data(path: &Path, interrupt: &Interrupt) -> Result<()> {
    canonicalise_node(path, interrupt)?;

    let st = lstat(path).map_err(|e| StrataError::io_at(e.into(), path))?;
    if st.st_uid != geteuid().as_raw() {
        return Err(StrataError::WrongOwnership {
            path: path.to_owned(),
        });
    }
    Ok(())
}
