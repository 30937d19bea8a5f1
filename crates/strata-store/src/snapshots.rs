//! Versioning-filesystem hook.
//!
//! State paths live on a filesystem that can snapshot a directory's content
//! under a timestamp and later revert it. That filesystem is an external
//! collaborator; the engine talks to it through [`SnapshotFs`].
//! [`DirSnapshotFs`] is the bundled implementation: it spools canonical
//! archives of the snapshotted tree under the database root, which is enough
//! for single-host stores and for the test suite.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use strata_error::{Result, StrataError};
use strata_types::{Sha256Hash, Timestamp};

use crate::archive;

/// Snapshot/revert operations on one directory.
pub trait SnapshotFs: Send + Sync {
    /// Capture the current content of `dir` and return the timestamp it was
    /// filed under. Timestamps strictly increase per provider.
    fn snapshot(&self, dir: &Path) -> Result<Timestamp>;

    /// Restore `dir` to the content captured at `ts`.
    fn revert(&self, dir: &Path, ts: Timestamp) -> Result<()>;
}

/// Archive-spooling [`SnapshotFs`] backed by a plain directory.
pub struct DirSnapshotFs {
    spool: PathBuf,
    last: AtomicU64,
}

impl DirSnapshotFs {
    pub fn new(spool: PathBuf) -> DirSnapshotFs {
        DirSnapshotFs {
            spool,
            last: AtomicU64::new(0),
        }
    }

    fn slot(&self, dir: &Path) -> PathBuf {
        let key = Sha256Hash::digest(dir.to_string_lossy().as_bytes())
            .compress()
            .to_base32();
        self.spool.join(key)
    }

    fn fresh_timestamp(&self) -> Timestamp {
        let now = Timestamp::now().get();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .expect("fetch_update closure never returns None");
        Timestamp(now.max(prev + 1))
    }
}

impl SnapshotFs for DirSnapshotFs {
    fn snapshot(&self, dir: &Path) -> Result<Timestamp> {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| StrataError::io_at(e, dir))?;
        }
        let ts = self.fresh_timestamp();
        let slot = self.slot(dir);
        fs::create_dir_all(&slot).map_err(|e| StrataError::io_at(e, &slot))?;

        let bytes = archive::dump_to_vec(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&slot)
            .map_err(|e| StrataError::io_at(e, &slot))?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(slot.join(format!("{}.snap", ts.get())))
            .map_err(|e| StrataError::Io(e.error))?;
        Ok(ts)
    }

    fn revert(&self, dir: &Path, ts: Timestamp) -> Result<()> {
        let snap = self.slot(dir).join(format!("{}.snap", ts.get()));
        let bytes = fs::read(&snap).map_err(|e| StrataError::io_at(e, &snap))?;
        if dir.exists() {
            fs::remove_dir_all(dir).map_err(|e| StrataError::io_at(e, dir))?;
        }
        archive::restore_path(dir, &mut bytes.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_then_revert_restores_content() {
        let base = tempfile::tempdir().unwrap();
        let fs_impl = DirSnapshotFs::new(base.path().join("spool"));
        let dir = base.path().join("state");
        fs::create_dir_all(&dir).unwrap();

        fs::write(dir.join("data"), b"v1").unwrap();
        let t1 = fs_impl.snapshot(&dir).unwrap();

        fs::write(dir.join("data"), b"v2").unwrap();
        fs::write(dir.join("extra"), b"x").unwrap();
        let t2 = fs_impl.snapshot(&dir).unwrap();
        assert!(t2 > t1);

        fs_impl.revert(&dir, t1).unwrap();
        assert_eq!(fs::read(dir.join("data")).unwrap(), b"v1");
        assert!(!dir.join("extra").exists());

        fs_impl.revert(&dir, t2).unwrap();
        assert_eq!(fs::read(dir.join("data")).unwrap(), b"v2");
        assert!(dir.join("extra").exists());
    }

    #[test]
    fn revert_to_unknown_timestamp_fails() {
        let base = tempfile::tempdir().unwrap();
        let fs_impl = DirSnapshotFs::new(base.path().join("spool"));
        let dir = base.path().join("state");
        fs::create_dir_all(&dir).unwrap();
        assert!(fs_impl.revert(&dir, Timestamp(42)).is_err());
    }

    #[test]
    fn snapshotting_a_missing_directory_creates_it() {
        let base = tempfile::tempdir().unwrap();
        let fs_impl = DirSnapshotFs::new(base.path().join("spool"));
        let dir = base.path().join("fresh");
        fs_impl.snapshot(&dir).unwrap();
        assert!(dir.is_dir());
    }
}
