//! The reference graph: four directed edge relations between component and
//! state nodes, plus the solid state references scanning cannot discover.
//!
//! Component-keyed rows are unrevisioned (components are immutable). State
//! -keyed rows are keyed `(state path, timestamp)`; reads resolve a revision
//! to a timestamp through the revision index first and never compare
//! revision numbers to timestamps directly. Every state-keyed access begins
//! with an alias dereference.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::debug;

use strata_error::{Result, StrataError};
use strata_kv::{merge_key, split_key, TableId, Transaction};
use strata_types::{Revision, Timestamp};

use crate::registry::key;
use crate::store::{LocalStore, PathKind, Reader};

/// Which value type an edge query returns.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefKind {
    /// Component-valued edges (RefCC / RefSC).
    Component,
    /// State-valued edges (RefCS / RefSS).
    State,
}

fn to_set(values: Vec<String>) -> BTreeSet<PathBuf> {
    values.into_iter().map(PathBuf::from).collect()
}

fn to_list(set: &BTreeSet<PathBuf>) -> Vec<String> {
    set.iter().map(|p| p.display().to_string()).collect()
}

impl LocalStore {
    /// Largest timestamp with an edge row keyed by `path` (not an alias
    /// walk: the caller dereferences first).
    pub(crate) fn latest_state_timestamp_in(
        &self,
        r: &Reader<'_, '_>,
        path: &Path,
    ) -> Option<Timestamp> {
        let mut best: Option<u64> = None;
        for table in [self.tables.ref_sc, self.tables.ref_ss] {
            for row_key in r.enumerate(table) {
                let Some((p, t)) = split_key(&row_key) else {
                    continue;
                };
                if p == path && best.map(|b| t > b).unwrap_or(true) {
                    best = Some(t);
                }
            }
        }
        best.map(Timestamp)
    }

    /// Timestamp a state write at `revision` lands on: a fresh mint for the
    /// latest-revision sentinel, the revision's recorded timestamp otherwise.
    fn state_write_timestamp(
        &self,
        r: &Reader<'_, '_>,
        path: &Path,
        revision: Revision,
    ) -> Result<Timestamp> {
        if revision.is_latest() {
            Ok(self.fresh_timestamp())
        } else {
            self.revision_to_timestamp_in(r, path, revision)
        }
    }

    /// Write the outgoing references of `path`.
    ///
    /// Component sources overwrite their single row; state sources write a
    /// new `(path, timestamp)` row against the non-shared tip. Fails with
    /// [`StrataError::NotRealisable`] when a non-empty set is written for a
    /// path that is neither valid nor substitutable.
    pub fn set_references_txn(
        &self,
        txn: &mut Transaction<'_>,
        path: &Path,
        references: &BTreeSet<PathBuf>,
        state_references: &BTreeSet<PathBuf>,
        revision: Revision,
    ) -> Result<()> {
        let non_empty = !references.is_empty() || !state_references.is_empty();
        {
            let r = Reader::Txn(txn);
            if non_empty && !self.is_realisable_component_or_state_in(&r, path) {
                return Err(StrataError::NotRealisable {
                    path: path.to_owned(),
                });
            }
        }

        match self.classify(path)? {
            PathKind::Component => {
                let (old_c, old_s) = {
                    let r = Reader::Txn(txn);
                    (
                        to_set(r.get_list(self.tables.ref_cc, &key(path))),
                        to_set(r.get_list(self.tables.ref_cs, &key(path))),
                    )
                };
                if old_c == *references && old_s == *state_references {
                    return Ok(());
                }
                debug!(path = %path.display(), "setting component references");
                txn.set_list(self.tables.ref_cc, &key(path), to_list(references));
                txn.set_list(self.tables.ref_cs, &key(path), to_list(state_references));
            }
            PathKind::State => {
                let (tip, ts, had_rows) = {
                    let r = Reader::Txn(txn);
                    let tip = self.to_non_shared_in(&r, path);
                    let had_rows = self.latest_state_timestamp_in(&r, &tip).is_some();
                    let ts = self.state_write_timestamp(&r, &tip, revision)?;
                    (tip, ts, had_rows)
                };
                if !non_empty && !had_rows {
                    return Ok(());
                }
                debug!(
                    path = %tip.display(),
                    timestamp = ts.get(),
                    "setting state references"
                );
                let row = merge_key(&tip, ts.get());
                txn.set_list(self.tables.ref_sc, &row, to_list(references));
                txn.set_list(self.tables.ref_ss, &row, to_list(state_references));
            }
        }
        Ok(())
    }

    /// Write the outgoing references of `path` in its own transaction.
    pub fn set_references(
        &self,
        path: &Path,
        references: &BTreeSet<PathBuf>,
        state_references: &BTreeSet<PathBuf>,
        revision: Revision,
    ) -> Result<()> {
        let mut txn = self.db.transaction()?;
        self.set_references_txn(&mut txn, path, references, state_references, revision)?;
        txn.commit()
    }

    // -----------------------------------------------------------------------
    // Outgoing edges
    // -----------------------------------------------------------------------

    pub(crate) fn query_references_in(
        &self,
        r: &Reader<'_, '_>,
        path: &Path,
        kind: RefKind,
        revision: Revision,
    ) -> Result<BTreeSet<PathBuf>> {
        if self.is_realisable_in(r, path) {
            let table = match kind {
                RefKind::Component => self.tables.ref_cc,
                RefKind::State => self.tables.ref_cs,
            };
            Ok(to_set(r.get_list(table, &key(path))))
        } else if self.is_realisable_state_in(r, path) {
            let tip = self.to_non_shared_in(r, path);
            let table = match kind {
                RefKind::Component => self.tables.ref_sc,
                RefKind::State => self.tables.ref_ss,
            };
            let ts = if revision.is_latest() {
                match self.latest_state_timestamp_in(r, &tip) {
                    Some(ts) => ts,
                    None => return Ok(BTreeSet::new()),
                }
            } else {
                self.revision_to_timestamp_in(r, &tip, revision)?
            };
            Ok(to_set(r.get_list(table, &merge_key(&tip, ts.get()))))
        } else {
            Err(StrataError::NotValid {
                path: path.to_owned(),
            })
        }
    }

    /// Outgoing component references of a component or state path.
    pub fn query_references(&self, path: &Path, revision: Revision) -> Result<BTreeSet<PathBuf>> {
        self.query_references_in(&self.reader(), path, RefKind::Component, revision)
    }

    pub fn query_references_txn(
        &self,
        txn: &Transaction<'_>,
        path: &Path,
        revision: Revision,
    ) -> Result<BTreeSet<PathBuf>> {
        self.query_references_in(&Reader::Txn(txn), path, RefKind::Component, revision)
    }

    /// Outgoing state references of a component or state path.
    pub fn query_state_references(
        &self,
        path: &Path,
        revision: Revision,
    ) -> Result<BTreeSet<PathBuf>> {
        self.query_references_in(&self.reader(), path, RefKind::State, revision)
    }

    pub fn query_state_references_txn(
        &self,
        txn: &Transaction<'_>,
        path: &Path,
        revision: Revision,
    ) -> Result<BTreeSet<PathBuf>> {
        self.query_references_in(&Reader::Txn(txn), path, RefKind::State, revision)
    }

    // -----------------------------------------------------------------------
    // Incoming edges
    // -----------------------------------------------------------------------

    /// Referrer scan. There is no inverse index: the candidate edge table is
    /// enumerated in full, state-keyed candidates projected to their
    /// latest-or-bounded timestamp, and membership tested row by row.
    fn query_referrers_in(
        &self,
        r: &Reader<'_, '_>,
        path: &Path,
        kind: RefKind,
        revision: Revision,
    ) -> Result<BTreeSet<PathBuf>> {
        if !self.is_realisable_component_or_state_in(r, path) {
            return Err(StrataError::NotValid {
                path: path.to_owned(),
            });
        }

        let target_is_state = self.is_valid_state_path_in(r, path)
            || (!self.is_valid_path_in(r, path)
                && self.classify(path).map(|k| k == PathKind::State).unwrap_or(false));
        let target = if target_is_state {
            self.to_non_shared_in(r, path)
        } else {
            path.to_owned()
        };
        let target_key = key(&target);

        match kind {
            // Component-keyed tables: immutable sources, no timestamps.
            RefKind::Component => {
                let table = if target_is_state {
                    self.tables.ref_cs
                } else {
                    self.tables.ref_cc
                };
                let mut out = BTreeSet::new();
                for source in r.enumerate(table) {
                    if r.get_list(table, &source).iter().any(|v| *v == target_key) {
                        out.insert(PathBuf::from(source));
                    }
                }
                Ok(out)
            }
            // State-keyed tables: project each source to one timestamp.
            RefKind::State => {
                let table = if target_is_state {
                    self.tables.ref_ss
                } else {
                    self.tables.ref_sc
                };
                let bound = if revision.is_latest() || !target_is_state {
                    None
                } else {
                    Some(self.revision_to_timestamp_in(r, &target, revision)?)
                };
                Ok(self.scan_state_table(r, table, &target_key, bound))
            }
        }
    }

    fn scan_state_table(
        &self,
        r: &Reader<'_, '_>,
        table: TableId,
        target_key: &str,
        bound: Option<Timestamp>,
    ) -> BTreeSet<PathBuf> {
        // Largest timestamp per source, capped by the bound; sources with no
        // row under the bound contribute no edge.
        let mut latest: BTreeMap<PathBuf, u64> = BTreeMap::new();
        for row_key in r.enumerate(table) {
            let Some((source, t)) = split_key(&row_key) else {
                continue;
            };
            if let Some(b) = bound {
                if t > b.get() {
                    continue;
                }
            }
            let entry = latest.entry(source).or_insert(t);
            if t > *entry {
                *entry = t;
            }
        }

        let mut out = BTreeSet::new();
        for (source, t) in latest {
            let row = merge_key(&source, t);
            if r.get_list(table, &row).iter().any(|v| v == target_key) {
                out.insert(source);
            }
        }
        out
    }

    /// Component paths referring to `path`, at the latest cut or bounded by
    /// a revision of the (state) target.
    pub fn query_referrers(&self, path: &Path, revision: Revision) -> Result<BTreeSet<PathBuf>> {
        self.query_referrers_in(&self.reader(), path, RefKind::Component, revision)
    }

    pub fn query_referrers_txn(
        &self,
        txn: &Transaction<'_>,
        path: &Path,
        revision: Revision,
    ) -> Result<BTreeSet<PathBuf>> {
        self.query_referrers_in(&Reader::Txn(txn), path, RefKind::Component, revision)
    }

    /// State paths referring to `path`.
    pub fn query_state_referrers(
        &self,
        path: &Path,
        revision: Revision,
    ) -> Result<BTreeSet<PathBuf>> {
        self.query_referrers_in(&self.reader(), path, RefKind::State, revision)
    }

    pub fn query_state_referrers_txn(
        &self,
        txn: &Transaction<'_>,
        path: &Path,
        revision: Revision,
    ) -> Result<BTreeSet<PathBuf>> {
        self.query_referrers_in(&Reader::Txn(txn), path, RefKind::State, revision)
    }

    // -----------------------------------------------------------------------
    // Solid state references
    // -----------------------------------------------------------------------

    /// Record the state references of `component` that byte-scanning cannot
    /// discover (state reached through e.g. a home-directory symlink).
    /// Callers of the scanner union these with scan results.
    pub fn set_solid_state_refs_txn(
        &self,
        txn: &mut Transaction<'_>,
        component: &Path,
        references: &BTreeSet<PathBuf>,
    ) -> Result<()> {
        crate::paths::assert_store_path(self.config(), component)?;
        txn.set_list(
            self.tables.solid_state_refs,
            &key(component),
            to_list(references),
        );
        Ok(())
    }

    pub fn set_solid_state_refs(
        &self,
        component: &Path,
        references: &BTreeSet<PathBuf>,
    ) -> Result<()> {
        let mut txn = self.db.transaction()?;
        self.set_solid_state_refs_txn(&mut txn, component, references)?;
        txn.commit()
    }

    /// The solid state references of `component` (empty when none are
    /// recorded).
    pub fn query_solid_state_refs(&self, component: &Path) -> BTreeSet<PathBuf> {
        to_set(
            self.reader()
                .get_list(self.tables.solid_state_refs, &key(component)),
        )
    }
}
