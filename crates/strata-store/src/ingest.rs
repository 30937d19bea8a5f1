//! Ingestion: `add_to_store` and `add_text_to_store`.
//!
//! Both share one pipeline: compute the target path, pin it with a temp
//! root, and then, under a per-path lock with a double-checked validity
//! test, materialise, verify, canonicalise, and register in one
//! transaction. The
//! double check under the lock is load-bearing: two concurrent ingestions of
//! the same path produce exactly one materialisation, and the loser simply
//! observes the path as already valid.

use std::collections::BTreeSet;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use strata_error::{Result, StrataError};

use crate::archive;
use crate::canonicalise::canonicalise_path_meta_data;
use crate::locks::PathLocks;
use crate::paths;
use crate::registry::ValidPathInfo;
use crate::store::LocalStore;

/// Delete a filesystem entry recursively. Canonicalised trees carry
/// read-only directory modes, so directories are re-opened for writing
/// before removal.
pub fn delete_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StrataError::io_at(e, path)),
    };

    if meta.is_dir() {
        for entry in walkdir::WalkDir::new(path).follow_links(false) {
            let entry = entry.map_err(|e| {
                StrataError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walk error without io cause")),
                )
            })?;
            if entry.file_type().is_dir() {
                let perms = entry.metadata().map(|m| m.permissions().mode()).unwrap_or(0);
                let _ = fs::set_permissions(
                    entry.path(),
                    fs::Permissions::from_mode(perms | 0o700),
                );
            }
        }
        fs::remove_dir_all(path).map_err(|e| StrataError::io_at(e, path))?;
    } else {
        fs::remove_file(path).map_err(|e| StrataError::io_at(e, path))?;
    }
    Ok(())
}

fn absolutise(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_owned())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

impl LocalStore {
    /// Pin `path` against garbage collection for the lifetime of this
    /// process by appending it to the per-process temp-roots file.
    pub fn add_temp_root(&self, path: &Path) -> Result<()> {
        let dir = self.config().db_root.join("temproots");
        fs::create_dir_all(&dir).map_err(|e| StrataError::io_at(e, &dir))?;
        let file = dir.join(std::process::id().to_string());
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
            .map_err(|e| StrataError::io_at(e, &file))?;
        writeln!(f, "{}", path.display())?;
        Ok(())
    }

    /// Ingest the filesystem object at `src` and return its component path.
    ///
    /// Idempotent under concurrency: callers racing on the same content all
    /// return the same path backed by a single materialisation.
    pub fn add_to_store(&self, src: &Path, fixed: bool, recursive: bool) -> Result<PathBuf> {
        let src = absolutise(src)?;
        debug!(src = %src.display(), "adding path to the store");

        let (dst, hash) = paths::compute_store_path_for_path(self.config(), &src, fixed, recursive)?;
        self.add_temp_root(&dst)?;

        // The outer check avoids lock churn on the hot path; the check
        // under the lock is the authoritative one.
        if !self.is_valid_path(&dst) {
            let mut lock = PathLocks::lock([dst.clone()], self.interrupt())?;
            lock.set_deletion(true);

            if !self.is_valid_path(&dst) {
                if dst.exists() {
                    delete_path(&dst)?;
                }
                archive::copy_path(&src, &dst)?;

                let actual = archive::hash_path(&dst)?;
                if actual != hash {
                    return Err(StrataError::HashMismatch {
                        path: dst,
                        expected: hash.to_hex(),
                        actual: actual.to_hex(),
                    });
                }

                canonicalise_path_meta_data(&dst, self.interrupt())?;

                let mut txn = self.db.transaction()?;
                self.register_valid_path_txn(
                    &mut txn,
                    &ValidPathInfo::component(dst.clone(), hash),
                )?;
                txn.commit()?;
            }
            lock.set_deletion(false);
        }
        Ok(dst)
    }

    /// Ingest a text blob under `name`, recording `references` as its
    /// outgoing component edges. The references participate in the path
    /// digest, so identical bytes under different dependency sets land on
    /// different paths.
    pub fn add_text_to_store(
        &self,
        name: &str,
        contents: &str,
        references: &BTreeSet<PathBuf>,
    ) -> Result<PathBuf> {
        let dst = paths::compute_store_path_for_text(self.config(), name, contents, references)?;
        debug!(dst = %dst.display(), "adding text to the store");

        self.add_temp_root(&dst)?;

        if !self.is_valid_path(&dst) {
            let mut lock = PathLocks::lock([dst.clone()], self.interrupt())?;
            lock.set_deletion(true);

            if !self.is_valid_path(&dst) {
                if dst.exists() {
                    delete_path(&dst)?;
                }
                fs::write(&dst, contents).map_err(|e| StrataError::io_at(e, &dst))?;
                canonicalise_path_meta_data(&dst, self.interrupt())?;

                let hash = archive::hash_path(&dst)?;
                let mut txn = self.db.transaction()?;
                self.register_valid_path_txn(
                    &mut txn,
                    &ValidPathInfo::component(dst.clone(), hash)
                        .with_references(references.clone(), BTreeSet::new()),
                )?;
                txn.commit()?;
            }
            lock.set_deletion(false);
        }
        Ok(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use strata_types::Revision;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(StoreConfig::under(dir.path()), false).unwrap();
        (dir, store)
    }

    #[test]
    fn add_to_store_registers_and_canonicalises() {
        let (dir, s) = store();
        let src = dir.path().join("f");
        fs::write(&src, b"hello\n").unwrap();

        let p = s.add_to_store(&src, false, true).unwrap();
        assert!(s.is_valid_path(&p));
        assert_eq!(
            s.query_path_hash(&p).unwrap(),
            archive::hash_path(&src).unwrap()
        );
        assert!(s.query_references(&p, Revision::LATEST).unwrap().is_empty());

        // The ingested copy is canonical.
        let mode = fs::metadata(&p).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o444);

        // Re-adding the same content is a no-op returning the same path.
        let again = s.add_to_store(&src, false, true).unwrap();
        assert_eq!(again, p);
    }

    #[test]
    fn different_names_yield_different_paths() {
        let (dir, s) = store();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();
        assert_ne!(
            s.add_to_store(&a, false, true).unwrap(),
            s.add_to_store(&b, false, true).unwrap()
        );
    }

    #[test]
    fn add_text_records_references() {
        let (dir, s) = store();
        let src = dir.path().join("dep");
        fs::write(&src, b"dep contents").unwrap();
        let dep = s.add_to_store(&src, false, true).unwrap();

        let refs = BTreeSet::from([dep.clone()]);
        let p = s
            .add_text_to_store("x.recipe", &format!("mentions {}", dep.display()), &refs)
            .unwrap();
        assert!(s.is_valid_path(&p));
        assert_eq!(s.query_references(&p, Revision::LATEST).unwrap(), refs);

        // Same bytes, no references: a different path.
        let bare = s
            .add_text_to_store(
                "x.recipe",
                &format!("mentions {}", dep.display()),
                &BTreeSet::new(),
            )
            .unwrap();
        assert_ne!(bare, p);
    }

    #[test]
    fn text_references_must_be_valid() {
        let (_d, s) = store();
        let ghost = s.config().store_root.join("aaa-ghost");
        let err = s
            .add_text_to_store("x", "contents", &BTreeSet::from([ghost]))
            .unwrap_err();
        assert!(matches!(err, StrataError::NotValid { .. }));
    }

    #[test]
    fn delete_path_handles_read_only_trees() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/f"), b"x").unwrap();
        fs::set_permissions(&root, fs::Permissions::from_mode(0o555)).unwrap();
        fs::set_permissions(root.join("sub"), fs::Permissions::from_mode(0o555)).unwrap();

        delete_path(&root).unwrap();
        assert!(!root.exists());
        // Deleting a missing path is fine.
        delete_path(&root).unwrap();
    }
}
