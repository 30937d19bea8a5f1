//! Shared-state aliasing: one state path aliased onto another.
//!
//! Aliases form a forest. Every state-keyed read or write first walks to the
//! non-shared tip through [`LocalStore::to_non_shared_in`], so two aliases of
//! the same underlying state can never disagree about its edges.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use strata_error::{Result, StrataError};
use strata_kv::Transaction;

use crate::paths;
use crate::store::{LocalStore, Reader};

impl LocalStore {
    /// Record that `to` aliases `from`, replacing any earlier alias of `to`.
    ///
    /// Refuses aliases that would close a cycle: the dereference walk must
    /// terminate.
    pub fn set_shared_state_txn(
        &self,
        txn: &mut Transaction<'_>,
        from: &Path,
        to: &Path,
    ) -> Result<()> {
        paths::assert_state_path(self.config(), from)?;
        paths::assert_state_path(self.config(), to)?;

        let mut cursor = from.to_owned();
        loop {
            if cursor == to {
                return Err(StrataError::AliasCycle {
                    from: from.to_owned(),
                    to: to.to_owned(),
                });
            }
            match txn.get(self.tables.shared_state, &cursor.display().to_string()) {
                Some(next) => cursor = PathBuf::from(next),
                None => break,
            }
        }

        let key = to.display().to_string();
        txn.delete(self.tables.shared_state, &key);
        txn.set(
            self.tables.shared_state,
            &key,
            &from.display().to_string(),
        );
        Ok(())
    }

    /// Transactional wrapper around [`Self::set_shared_state_txn`].
    pub fn set_shared_state(&self, from: &Path, to: &Path) -> Result<()> {
        let mut txn = self.db.transaction()?;
        self.set_shared_state_txn(&mut txn, from, to)?;
        txn.commit()
    }

    /// The alias target of `path`, if it is shared.
    pub fn query_shared_state(&self, path: &Path) -> Option<PathBuf> {
        self.reader()
            .get(self.tables.shared_state, &path.display().to_string())
            .map(PathBuf::from)
    }

    pub(crate) fn to_non_shared_in(&self, r: &Reader<'_, '_>, path: &Path) -> PathBuf {
        let mut cursor = path.to_owned();
        while let Some(next) = r.get(self.tables.shared_state, &cursor.display().to_string()) {
            cursor = PathBuf::from(next);
        }
        cursor
    }

    /// Follow alias links to the non-shared tip.
    pub fn to_non_shared(&self, path: &Path) -> PathBuf {
        self.to_non_shared_in(&self.reader(), path)
    }

    /// Dereference a whole set of state paths.
    pub fn to_non_shared_set(&self, paths: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
        let r = self.reader();
        paths.iter().map(|p| self.to_non_shared_in(&r, p)).collect()
    }

    /// Every alias that reaches the same underlying state as `path`,
    /// excluding `path` itself.
    pub fn get_shared_with_rec(&self, path: &Path) -> BTreeSet<PathBuf> {
        let r = self.reader();
        let tip = self.to_non_shared_in(&r, path);

        let mut found = BTreeSet::new();
        if tip != path {
            found.insert(tip.clone());
        }

        // Reverse walk: repeatedly collect aliases pointing at anything
        // already found (or the tip) until a fixed point.
        let mut frontier = vec![tip];
        while let Some(current) = frontier.pop() {
            for direct in self.directly_shared_with(&r, &current) {
                if direct != *path && found.insert(direct.clone()) {
                    frontier.push(direct.clone());
                }
                if direct == *path {
                    // Still recurse below the queried path itself.
                    frontier.push(direct);
                }
            }
        }
        found.remove(path);
        found
    }

    fn directly_shared_with(&self, r: &Reader<'_, '_>, target: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for key in r.enumerate(self.tables.shared_state) {
            if let Some(value) = r.get(self.tables.shared_state, &key) {
                if Path::new(&value) == target {
                    out.push(PathBuf::from(key));
                }
            }
        }
        out
    }
}
