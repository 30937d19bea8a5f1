//! The store object: one per process, created at startup, passed by
//! reference. Owns the metadata database, the table handles, the interrupt
//! flag, and the versioning-filesystem hook.

use std::env;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use strata_error::{Result, StrataError};
use strata_kv::{Database, TableId, Transaction};
use strata_types::{Interrupt, Timestamp};

use crate::config::{check_store_not_symlink, StoreConfig, REMOTE_VAR};
use crate::paths;
use crate::snapshots::{DirSnapshotFs, SnapshotFs};

/// Handles to every registry table.
///
/// The deriver row is a singleton for plain components and a set for
/// state-bearing ones; membership in `state_info` is what licenses the
/// multi-valued form.
pub(crate) struct Tables {
    /// `P_c` → `"sha256:" + hex`; existence ⇒ valid.
    pub valid_components: TableId,
    /// `P_s` → producing recipe path; existence ⇒ valid.
    pub valid_state: TableId,
    /// `P_c` → packed substitute records, newest first.
    pub substitutes: TableId,
    /// `P_c` → recipe path(s).
    pub derivers: TableId,
    /// `P_c` → empty; existence ⇒ component has a state path.
    pub state_info: TableId,
    /// `P_s` → commit interval counter.
    pub state_counters: TableId,
    /// Component → component references.
    pub ref_cc: TableId,
    /// Component → state references.
    pub ref_cs: TableId,
    /// `(P_s, t)` → component references.
    pub ref_sc: TableId,
    /// `(P_s, t)` → state references.
    pub ref_ss: TableId,
    /// `P_c` → state references scanning cannot discover.
    pub solid_state_refs: TableId,
    /// `(P_s, r)` → packed closure-member/timestamp pairs.
    pub revisions: TableId,
    /// `(P_s, r)` → free-text comment.
    pub revision_comments: TableId,
    /// `(P_s, r)` → per-subfolder snapshot timestamps, ordered by path.
    pub snapshots: TableId,
    /// `P_s` → `P_s`; child aliases parent.
    pub shared_state: TableId,
}

impl Tables {
    fn open(db: &Database) -> Tables {
        Tables {
            valid_components: db.open_table("validpaths"),
            valid_state: db.open_table("validpaths_state"),
            substitutes: db.open_table("substitutes"),
            derivers: db.open_table("derivers"),
            state_info: db.open_table("stateinfo"),
            state_counters: db.open_table("statecounters"),
            ref_cc: db.open_table("references_c_c"),
            ref_cs: db.open_table("references_c_s"),
            ref_sc: db.open_table("references_s_c"),
            ref_ss: db.open_table("references_s_s"),
            solid_state_refs: db.open_table("references_solid_c_s"),
            revisions: db.open_table("state_revisions"),
            revision_comments: db.open_table("state_revisions_comments"),
            snapshots: db.open_table("state_snapshots"),
            shared_state: db.open_table("shared_state"),
        }
    }
}

/// Which side of the component/state split a path falls on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PathKind {
    Component,
    State,
}

/// A read view: either the committed snapshot or an open transaction.
///
/// Query helpers are written once against this; readers holding no
/// transaction see the last committed state and must treat a path turning
/// invalid moments later as a legitimate outcome.
pub(crate) enum Reader<'a, 'db> {
    Committed(&'a Database),
    Txn(&'a Transaction<'db>),
}

impl Reader<'_, '_> {
    pub(crate) fn get(&self, table: TableId, key: &str) -> Option<String> {
        match self {
            Reader::Committed(db) => db.get(table, key),
            Reader::Txn(txn) => txn.get(table, key),
        }
    }

    pub(crate) fn get_list(&self, table: TableId, key: &str) -> Vec<String> {
        match self {
            Reader::Committed(db) => db.get_list(table, key),
            Reader::Txn(txn) => txn.get_list(table, key),
        }
    }

    pub(crate) fn contains(&self, table: TableId, key: &str) -> bool {
        match self {
            Reader::Committed(db) => db.contains(table, key),
            Reader::Txn(txn) => txn.contains(table, key),
        }
    }

    pub(crate) fn enumerate(&self, table: TableId) -> Vec<String> {
        match self {
            Reader::Committed(db) => db.enumerate(table),
            Reader::Txn(txn) => txn.enumerate(table),
        }
    }
}

/// The local store engine.
pub struct LocalStore {
    pub(crate) db: Database,
    pub(crate) tables: Tables,
    cfg: StoreConfig,
    interrupt: Interrupt,
    snapshots: Box<dyn SnapshotFs>,
    last_timestamp: AtomicU64,
}

impl LocalStore {
    /// Open the store described by `cfg`.
    ///
    /// Refuses when a remote store is configured; checks the store root's
    /// ancestor chain for symlinks; sizes (or removes) the reserved scratch
    /// file; opens the metadata database, falling back to read-only when the
    /// database directory denies writes; and runs schema migration.
    pub fn open(cfg: StoreConfig, reserve_space: bool) -> Result<LocalStore> {
        let snapshots = Box::new(DirSnapshotFs::new(cfg.db_root.join("snapshot-spool")));
        Self::open_with_snapshots(cfg, reserve_space, snapshots)
    }

    /// Open with an explicit versioning-filesystem implementation.
    pub fn open_with_snapshots(
        cfg: StoreConfig,
        reserve_space: bool,
        snapshots: Box<dyn SnapshotFs>,
    ) -> Result<LocalStore> {
        if let Ok(value) = env::var(REMOTE_VAR) {
            if !value.is_empty() {
                return Err(StrataError::RemoteConfigured { value });
            }
        }

        check_store_not_symlink(&cfg.store_root)?;

        for root in [&cfg.store_root, &cfg.state_root, &cfg.db_root] {
            fs::create_dir_all(root).map_err(|e| StrataError::io_at(e, root))?;
        }

        // Reserved scratch space for the collector; sizing failures are not
        // fatal (the store still works, the collector just has less slack).
        let reserved = cfg.db_root.join("reserved");
        if reserve_space {
            let size = cfg.reserved_space();
            let current = fs::metadata(&reserved).map(|m| m.len()).unwrap_or(0);
            if current != size {
                if let Err(e) = fs::write(&reserved, vec![b'X'; size as usize]) {
                    debug!(path = %reserved.display(), error = %e, "cannot size reserved file");
                }
            }
        } else {
            let _ = fs::remove_file(&reserved);
        }

        let db = Database::open(&cfg.db_root)?;
        let tables = Tables::open(&db);
        let store = LocalStore {
            db,
            tables,
            cfg,
            interrupt: Interrupt::new(),
            snapshots,
            last_timestamp: AtomicU64::new(0),
        };

        if !store.db.is_read_only() {
            store.check_schema()?;
        }
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn is_read_only(&self) -> bool {
        self.db.is_read_only()
    }

    pub(crate) fn snapshot_fs(&self) -> &dyn SnapshotFs {
        self.snapshots.as_ref()
    }

    /// Read view over the committed snapshot.
    pub(crate) fn reader(&self) -> Reader<'_, '_> {
        Reader::Committed(&self.db)
    }

    /// Mint a timestamp strictly greater than any minted before by this
    /// store object, tracking wall-clock time when it is ahead.
    pub(crate) fn fresh_timestamp(&self) -> Timestamp {
        let now = Timestamp::now().get();
        let minted = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .expect("fetch_update closure never returns None");
        Timestamp(now.max(minted + 1))
    }

    /// Classify a path by shape, rejecting paths under neither root.
    pub(crate) fn classify(&self, path: &Path) -> Result<PathKind> {
        if paths::is_store_path(&self.cfg, path) {
            Ok(PathKind::Component)
        } else if paths::is_state_path(&self.cfg, path) {
            Ok(PathKind::State)
        } else {
            Err(StrataError::NotStorePath {
                path: path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_roots_and_reserved_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::under(dir.path());
        let store = LocalStore::open(cfg.clone(), true).unwrap();
        assert!(cfg.store_root.is_dir());
        assert!(cfg.state_root.is_dir());
        assert_eq!(
            fs::metadata(cfg.db_root.join("reserved")).unwrap().len(),
            cfg.reserved_space()
        );
        assert!(!store.is_read_only());
        drop(store);

        // Re-opening without reserve_space removes the scratch file.
        let store = LocalStore::open(cfg.clone(), false).unwrap();
        assert!(!cfg.db_root.join("reserved").exists());
        drop(store);
    }

    #[test]
    fn fresh_timestamps_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(StoreConfig::under(dir.path()), false).unwrap();
        let a = store.fresh_timestamp();
        let b = store.fresh_timestamp();
        let c = store.fresh_timestamp();
        assert!(a < b && b < c);
    }
}
