//! Validity & hash registry.
//!
//! A component path is valid iff it has a row in the valid-components table
//! holding its content hash; a state path is valid iff it has a row naming
//! the recipe that produced it. A path is *realisable* when it is valid or
//! has substitutes. Reference, deriver, and state-info rows exist only for
//! realisable keys (the cleanup invariant); invalidation restores that
//! invariant before dropping the validity row.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use strata_error::{Result, StrataError};
use strata_kv::Transaction;
use strata_types::{Revision, Sha256Hash};

use crate::paths;
use crate::store::{LocalStore, PathKind, Reader};

/// Prefix of every hash row in the valid-components table.
const HASH_PREFIX: &str = "sha256:";

/// Everything registered for one path in one batch.
#[derive(Clone, Debug)]
pub struct ValidPathInfo {
    pub path: PathBuf,
    /// Content hash; required for component paths, ignored for state paths.
    pub hash: Option<Sha256Hash>,
    pub references: BTreeSet<PathBuf>,
    pub state_references: BTreeSet<PathBuf>,
    /// Producing recipe; for state paths this is the validity value itself.
    pub deriver: Option<PathBuf>,
    pub revision: Revision,
}

impl ValidPathInfo {
    /// Info for a component path with the given content hash.
    pub fn component(path: PathBuf, hash: Sha256Hash) -> ValidPathInfo {
        ValidPathInfo {
            path,
            hash: Some(hash),
            references: BTreeSet::new(),
            state_references: BTreeSet::new(),
            deriver: None,
            revision: Revision::LATEST,
        }
    }

    /// Info for a state path produced by `recipe`.
    pub fn state(path: PathBuf, recipe: PathBuf) -> ValidPathInfo {
        ValidPathInfo {
            path,
            hash: None,
            references: BTreeSet::new(),
            state_references: BTreeSet::new(),
            deriver: Some(recipe),
            revision: Revision::LATEST,
        }
    }

    pub fn with_references(
        mut self,
        references: BTreeSet<PathBuf>,
        state_references: BTreeSet<PathBuf>,
    ) -> ValidPathInfo {
        self.references = references;
        self.state_references = state_references;
        self
    }

    pub fn with_deriver(mut self, deriver: PathBuf) -> ValidPathInfo {
        self.deriver = Some(deriver);
        self
    }

    pub fn with_revision(mut self, revision: Revision) -> ValidPathInfo {
        self.revision = revision;
        self
    }
}

pub(crate) fn key(path: &Path) -> String {
    path.display().to_string()
}

impl LocalStore {
    // -----------------------------------------------------------------------
    // Predicates
    // -----------------------------------------------------------------------

    pub(crate) fn is_valid_path_in(&self, r: &Reader<'_, '_>, path: &Path) -> bool {
        r.contains(self.tables.valid_components, &key(path))
    }

    pub(crate) fn is_valid_state_path_in(&self, r: &Reader<'_, '_>, path: &Path) -> bool {
        r.contains(self.tables.valid_state, &key(path))
    }

    pub fn is_valid_path(&self, path: &Path) -> bool {
        self.is_valid_path_in(&self.reader(), path)
    }

    pub fn is_valid_path_txn(&self, txn: &Transaction<'_>, path: &Path) -> bool {
        self.is_valid_path_in(&Reader::Txn(txn), path)
    }

    pub fn is_valid_state_path(&self, path: &Path) -> bool {
        self.is_valid_state_path_in(&self.reader(), path)
    }

    pub fn is_valid_state_path_txn(&self, txn: &Transaction<'_>, path: &Path) -> bool {
        self.is_valid_state_path_in(&Reader::Txn(txn), path)
    }

    pub fn is_valid_component_or_state_path(&self, path: &Path) -> bool {
        let r = self.reader();
        self.is_valid_path_in(&r, path) || self.is_valid_state_path_in(&r, path)
    }

    /// Valid or backed by at least one substitute.
    pub(crate) fn is_realisable_in(&self, r: &Reader<'_, '_>, path: &Path) -> bool {
        self.is_valid_path_in(r, path) || self.has_substitutes_in(r, path)
    }

    pub(crate) fn is_realisable_state_in(&self, r: &Reader<'_, '_>, path: &Path) -> bool {
        self.is_valid_state_path_in(r, path) || self.has_substitutes_in(r, path)
    }

    pub(crate) fn is_realisable_component_or_state_in(
        &self,
        r: &Reader<'_, '_>,
        path: &Path,
    ) -> bool {
        self.is_realisable_in(r, path) || self.is_valid_state_path_in(r, path)
    }

    pub fn is_realisable(&self, path: &Path) -> bool {
        self.is_realisable_in(&self.reader(), path)
    }

    // -----------------------------------------------------------------------
    // Hash & recipe rows
    // -----------------------------------------------------------------------

    fn set_hash_txn(&self, txn: &mut Transaction<'_>, path: &Path, hash: &Sha256Hash) {
        txn.set(
            self.tables.valid_components,
            &key(path),
            &format!("{HASH_PREFIX}{}", hash.to_hex()),
        );
    }

    fn set_state_valid_txn(&self, txn: &mut Transaction<'_>, path: &Path, recipe: &Path) {
        txn.set(self.tables.valid_state, &key(path), &key(recipe));
    }

    pub(crate) fn query_path_hash_in(
        &self,
        r: &Reader<'_, '_>,
        path: &Path,
    ) -> Result<Sha256Hash> {
        let entry = r
            .get(self.tables.valid_components, &key(path))
            .ok_or_else(|| StrataError::NotValid {
                path: path.to_owned(),
            })?;
        let hex = entry
            .strip_prefix(HASH_PREFIX)
            .ok_or_else(|| StrataError::CorruptHashEntry {
                path: path.to_owned(),
                entry: entry.clone(),
            })?;
        Sha256Hash::parse_hex(hex).map_err(|_| StrataError::CorruptHashEntry {
            path: path.to_owned(),
            entry: entry.clone(),
        })
    }

    /// Content hash recorded for a valid component path.
    pub fn query_path_hash(&self, path: &Path) -> Result<Sha256Hash> {
        self.query_path_hash_in(&self.reader(), path)
    }

    /// Recipe recorded as having produced a valid state path.
    pub fn query_state_path_recipe(&self, path: &Path) -> Result<PathBuf> {
        self.reader()
            .get(self.tables.valid_state, &key(path))
            .map(PathBuf::from)
            .ok_or_else(|| StrataError::NotValidState {
                path: path.to_owned(),
            })
    }

    /// All valid component and state paths.
    pub fn query_all_valid_paths(&self) -> (BTreeSet<PathBuf>, BTreeSet<PathBuf>) {
        let components = self
            .db
            .enumerate(self.tables.valid_components)
            .into_iter()
            .map(PathBuf::from)
            .collect();
        let states = self
            .db
            .enumerate(self.tables.valid_state)
            .into_iter()
            .map(PathBuf::from)
            .collect();
        (components, states)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a batch of paths as valid in one transaction.
    ///
    /// The whole batch is collected first so members may reference each
    /// other; a reference to anything neither valid nor in the batch refuses
    /// the registration.
    pub fn register_valid_paths_txn(
        &self,
        txn: &mut Transaction<'_>,
        infos: &[ValidPathInfo],
    ) -> Result<()> {
        let batch: BTreeSet<&Path> = infos.iter().map(|i| i.path.as_path()).collect();

        for info in infos {
            for reference in &info.references {
                if !self.is_valid_path_txn(txn, reference)
                    && !batch.contains(reference.as_path())
                {
                    return Err(StrataError::NotValid {
                        path: reference.clone(),
                    });
                }
            }
        }

        for info in infos {
            let kind = self.classify(&info.path)?;
            debug!(path = %info.path.display(), "registering path");

            match kind {
                PathKind::Component => {
                    paths::assert_store_path(self.config(), &info.path)?;
                    let hash = info.hash.as_ref().ok_or_else(|| {
                        StrataError::internal(format!(
                            "component `{}` registered without a hash",
                            info.path.display()
                        ))
                    })?;
                    self.set_hash_txn(txn, &info.path, hash);
                }
                PathKind::State => {
                    paths::assert_state_path(self.config(), &info.path)?;
                    let recipe = info.deriver.clone().unwrap_or_default();
                    self.set_state_valid_txn(txn, &info.path, &recipe);
                }
            }

            self.set_references_txn(
                txn,
                &info.path,
                &info.references,
                &info.state_references,
                info.revision,
            )?;

            if kind == PathKind::Component {
                if let Some(deriver) = &info.deriver {
                    self.set_deriver_txn(txn, &info.path, deriver)?;
                }
            }
        }
        Ok(())
    }

    /// Register a single path as valid in one transaction.
    pub fn register_valid_path_txn(
        &self,
        txn: &mut Transaction<'_>,
        info: &ValidPathInfo,
    ) -> Result<()> {
        self.register_valid_paths_txn(txn, std::slice::from_ref(info))
    }

    /// Register a single path as valid in its own transaction.
    pub fn register_valid_path(&self, info: &ValidPathInfo) -> Result<()> {
        let mut txn = self.db.transaction()?;
        self.register_valid_path_txn(&mut txn, info)?;
        txn.commit()
    }

    // -----------------------------------------------------------------------
    // Invalidation & deletion
    // -----------------------------------------------------------------------

    /// Drop the reference rows keyed by `path` itself. Alias rows are left
    /// alone: an alias has no rows of its own, and clearing through the
    /// alias would damage the underlying state's history.
    fn clear_references_txn(&self, txn: &mut Transaction<'_>, path: &Path) {
        let k = key(path);
        txn.delete(self.tables.ref_cc, &k);
        txn.delete(self.tables.ref_cs, &k);
        let latest = self.latest_state_timestamp_in(&Reader::Txn(txn), path);
        if let Some(ts) = latest {
            let row = strata_kv::merge_key(path, ts.get());
            txn.delete(self.tables.ref_sc, &row);
            txn.delete(self.tables.ref_ss, &row);
        }
    }

    /// Unregister a path. The caller asserts there are no valid referrers.
    ///
    /// When no substitutes remain the reference and deriver rows go too,
    /// keeping the cleanup invariant; a substituted path keeps them so it
    /// can still be realised later.
    pub(crate) fn invalidate_path_txn(&self, txn: &mut Transaction<'_>, path: &Path) -> Result<()> {
        debug!(path = %path.display(), "unregistering path");

        if self.query_substitutes_txn(txn, path)?.is_empty() {
            self.clear_references_txn(txn, path);
            txn.delete(self.tables.derivers, &key(path));
            txn.delete(self.tables.state_info, &key(path));
        }

        txn.delete(self.tables.valid_components, &key(path));
        txn.delete(self.tables.valid_state, &key(path));
        Ok(())
    }

    /// Delete a component path from the store, failing with
    /// [`StrataError::PathInUse`] while any valid referrer remains. Returns
    /// the number of bytes freed on disk.
    pub fn delete_from_store(&self, path: &Path) -> Result<u64> {
        paths::assert_store_path(self.config(), path)?;

        let mut txn = self.db.transaction()?;
        if self.is_valid_path_txn(&txn, path) {
            // Referrers through any relation block the deletion: a valid
            // component or a valid state path still pointing here keeps the
            // closure intact.
            let referrers = self.query_referrers_txn(&txn, path, Revision::LATEST)?;
            for referrer in referrers {
                if referrer != path && self.is_valid_path_txn(&txn, &referrer) {
                    return Err(StrataError::PathInUse {
                        path: path.to_owned(),
                        referrer,
                    });
                }
            }
            let state_referrers =
                self.query_state_referrers_txn(&txn, path, Revision::LATEST)?;
            for referrer in state_referrers {
                if referrer != path && self.is_valid_state_path_txn(&txn, &referrer) {
                    return Err(StrataError::PathInUse {
                        path: path.to_owned(),
                        referrer,
                    });
                }
            }
            self.invalidate_path_txn(&mut txn, path)?;
        }
        txn.commit()?;

        let mut freed = 0u64;
        if path.exists() {
            for entry in walkdir::WalkDir::new(path).follow_links(false) {
                let entry = entry.map_err(|e| {
                    StrataError::Io(e.into_io_error().unwrap_or_else(|| {
                        std::io::Error::other("walk error without io cause")
                    }))
                })?;
                if entry.file_type().is_file() {
                    freed += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
            crate::ingest::delete_path(path)?;
        }
        Ok(freed)
    }
}
