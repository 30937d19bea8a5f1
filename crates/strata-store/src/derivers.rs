//! Deriver index and substitute table.
//!
//! A stateless component has exactly one deriver. A state-bearing component
//! keeps a set of derivers, one per `(state identifier, owner)` pair; adding
//! a deriver for an occupied pair supersedes the old recipe and deletes its
//! on-disk file. Substitute rows use a packed four-field record whose first
//! field is the version literal `"2"`; rows carrying any other version are
//! skipped silently.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use strata_error::{Result, StrataError};
use strata_kv::{pack_strings, unpack_strings, Transaction};
use strata_types::Substitute;

use crate::paths;
use crate::recipe::{self, Recipe};
use crate::registry::key;
use crate::store::{LocalStore, Reader};

/// Version literal carried by every current substitute record.
const SUBSTITUTE_VERSION: &str = "2";

impl LocalStore {
    // -----------------------------------------------------------------------
    // Derivers
    // -----------------------------------------------------------------------

    /// Record the recipe that produced `store_path`. State-bearing recipes
    /// are redirected into the merging index.
    pub fn set_deriver_txn(
        &self,
        txn: &mut Transaction<'_>,
        store_path: &Path,
        deriver: &Path,
    ) -> Result<()> {
        paths::assert_store_path(self.config(), store_path)?;
        if deriver.as_os_str().is_empty() {
            return Ok(());
        }
        paths::assert_store_path(self.config(), deriver)?;
        {
            let r = Reader::Txn(txn);
            if !self.is_realisable_in(&r, store_path) {
                return Err(StrataError::NotValid {
                    path: store_path.to_owned(),
                });
            }
        }

        if recipe::is_recipe_path(deriver) && deriver.exists() {
            let parsed = recipe::read_recipe(deriver)?;
            if parsed.is_state_recipe() {
                return self.add_state_deriver_txn(txn, store_path, deriver, &parsed);
            }
        }
        txn.set(self.tables.derivers, &key(store_path), &key(deriver));
        Ok(())
    }

    /// Record a deriver in its own transaction.
    pub fn set_deriver(&self, store_path: &Path, deriver: &Path) -> Result<()> {
        let mut txn = self.db.transaction()?;
        self.set_deriver_txn(&mut txn, store_path, deriver)?;
        txn.commit()
    }

    /// The single deriver of a stateless component (`None` when unrecorded).
    /// State-bearing components must be queried through
    /// [`Self::query_derivers`].
    pub fn query_deriver(&self, store_path: &Path) -> Result<Option<PathBuf>> {
        let r = self.reader();
        if !self.is_realisable_in(&r, store_path) {
            return Err(StrataError::NotValid {
                path: store_path.to_owned(),
            });
        }
        if r.contains(self.tables.state_info, &key(store_path)) {
            return Err(StrataError::internal(format!(
                "`{}` is state-bearing; use query_derivers",
                store_path.display()
            )));
        }
        Ok(r.get(self.tables.derivers, &key(store_path))
            .map(PathBuf::from))
    }

    /// Merge `deriver` into the state-deriver set of `store_path`.
    ///
    /// Any existing entry with the same `(state identifier, owner)` but a
    /// different recipe path is superseded: removed from the set and its
    /// on-disk recipe file deleted. Entries for other pairs are kept. The
    /// component is marked state-bearing.
    fn add_state_deriver_txn(
        &self,
        txn: &mut Transaction<'_>,
        store_path: &Path,
        deriver: &Path,
        parsed: &Recipe,
    ) -> Result<()> {
        recipe::check_state_path(self.config(), parsed, deriver)?;
        let new_out = parsed.state_output(deriver)?;
        let identifier = new_out.state_identifier.clone();
        let owner = new_out.owner.clone();

        let current: Vec<PathBuf> = {
            let r = Reader::Txn(txn);
            r.get_list(self.tables.derivers, &key(store_path))
                .into_iter()
                .map(PathBuf::from)
                .collect()
        };

        let mut updated: Vec<PathBuf> = Vec::with_capacity(current.len() + 1);
        for existing in current {
            if existing == deriver {
                continue; // re-registering the same recipe is a no-op
            }
            let old = recipe::read_recipe(&existing)?;
            let out = old.state_output(&existing)?;
            let keep = out.state_identifier != identifier || out.owner != owner;
            if keep {
                updated.push(existing);
            } else {
                info!(
                    recipe = %existing.display(),
                    identifier = %identifier,
                    owner = %owner,
                    "deleting superseded state recipe"
                );
                crate::ingest::delete_path(&existing)?;
            }
        }
        updated.push(deriver.to_owned());

        txn.set_list(
            self.tables.derivers,
            &key(store_path),
            updated.iter().map(|p| key(p)).collect(),
        );
        txn.set(self.tables.state_info, &key(store_path), "");
        Ok(())
    }

    /// Add a state deriver in its own transaction.
    pub fn add_state_deriver(&self, store_path: &Path, deriver: &Path) -> Result<()> {
        let parsed = recipe::read_recipe(deriver)?;
        let mut txn = self.db.transaction()?;
        {
            let r = Reader::Txn(&txn);
            if !self.is_realisable_in(&r, store_path) {
                return Err(StrataError::NotValid {
                    path: store_path.to_owned(),
                });
            }
        }
        self.add_state_deriver_txn(&mut txn, store_path, deriver, &parsed)?;
        txn.commit()
    }

    /// The state derivers of `store_path` matching both filters; `"*"` in
    /// either position is a wildcard. An empty owner is refused: stateless
    /// components go through [`Self::query_deriver`].
    pub fn query_derivers(
        &self,
        store_path: &Path,
        identifier: &str,
        owner: &str,
    ) -> Result<BTreeSet<PathBuf>> {
        let r = self.reader();
        if !self.is_realisable_in(&r, store_path) {
            return Err(StrataError::NotValid {
                path: store_path.to_owned(),
            });
        }
        if owner.is_empty() {
            return Err(StrataError::internal(
                "query_derivers called with an empty owner; use query_deriver",
            ));
        }

        let mut out = BTreeSet::new();
        for entry in r.get_list(self.tables.derivers, &key(store_path)) {
            let path = PathBuf::from(&entry);
            let Ok(parsed) = recipe::read_recipe(&path) else {
                continue;
            };
            let Ok(state_out) = parsed.state_output(&path) else {
                continue;
            };
            if (state_out.state_identifier == identifier || identifier == "*")
                && (state_out.owner == owner || owner == "*")
            {
                out.insert(path);
            }
        }
        Ok(out)
    }

    /// Does this component have an associated state path?
    pub fn is_state_component(&self, store_path: &Path) -> bool {
        self.reader()
            .contains(self.tables.state_info, &key(store_path))
    }

    // -----------------------------------------------------------------------
    // Substitutes
    // -----------------------------------------------------------------------

    pub(crate) fn read_substitutes_in(
        &self,
        r: &Reader<'_, '_>,
        path: &Path,
    ) -> Result<Vec<Substitute>> {
        let mut subs = Vec::new();
        for row in r.get_list(self.tables.substitutes, &key(path)) {
            let Ok(fields) = unpack_strings(&row) else {
                continue; // unreadable rows are skipped, not fatal
            };
            let Some(version) = fields.first() else {
                continue;
            };
            if version != SUBSTITUTE_VERSION {
                continue;
            }
            if fields.len() != 4 {
                return Err(StrataError::MalformedSubstitute {
                    detail: format!("expected 4 fields, got {}", fields.len()),
                });
            }
            subs.push(Substitute {
                deriver: PathBuf::from(&fields[1]),
                program: fields[2].clone(),
                args: unpack_strings(&fields[3])?,
            });
        }
        Ok(subs)
    }

    fn write_substitutes_txn(
        &self,
        txn: &mut Transaction<'_>,
        path: &Path,
        subs: &[Substitute],
    ) {
        let rows = subs
            .iter()
            .map(|s| {
                pack_strings(&[
                    SUBSTITUTE_VERSION.to_owned(),
                    s.deriver.display().to_string(),
                    s.program.clone(),
                    pack_strings(&s.args),
                ])
            })
            .collect();
        txn.set_list(self.tables.substitutes, &key(path), rows);
    }

    pub(crate) fn has_substitutes_in(&self, r: &Reader<'_, '_>, path: &Path) -> bool {
        self.read_substitutes_in(r, path)
            .map(|subs| !subs.is_empty())
            .unwrap_or(false)
    }

    /// Register a substitute for `path`. New substitutes take precedence: an
    /// already-present record moves to the front.
    pub fn register_substitute_txn(
        &self,
        txn: &mut Transaction<'_>,
        path: &Path,
        substitute: &Substitute,
    ) -> Result<()> {
        paths::assert_store_path(self.config(), path)?;
        let mut subs = self.read_substitutes_in(&Reader::Txn(txn), path)?;
        subs.retain(|s| s != substitute);
        subs.insert(0, substitute.clone());
        self.write_substitutes_txn(txn, path, &subs);
        Ok(())
    }

    pub fn register_substitute(&self, path: &Path, substitute: &Substitute) -> Result<()> {
        let mut txn = self.db.transaction()?;
        self.register_substitute_txn(&mut txn, path, substitute)?;
        txn.commit()
    }

    /// The substitutes recorded for `path`, newest first.
    pub fn query_substitutes(&self, path: &Path) -> Result<Vec<Substitute>> {
        self.read_substitutes_in(&self.reader(), path)
    }

    pub(crate) fn query_substitutes_txn(
        &self,
        txn: &Transaction<'_>,
        path: &Path,
    ) -> Result<Vec<Substitute>> {
        self.read_substitutes_in(&Reader::Txn(txn), path)
    }

    /// Has `path` at least one substitute?
    pub fn has_substitutes(&self, path: &Path) -> bool {
        self.has_substitutes_in(&self.reader(), path)
    }

    /// Drop every substitute row. Paths that were realisable only through a
    /// substitute are invalidated to keep the cleanup invariant.
    pub fn clear_substitutes(&self) -> Result<()> {
        let mut txn = self.db.transaction()?;
        let keys = txn.enumerate(self.tables.substitutes);
        for k in keys {
            self.interrupt().check()?;
            txn.delete(self.tables.substitutes, &k);
            let path = PathBuf::from(&k);
            if !self.is_valid_path_txn(&txn, &path) {
                debug!(path = %path.display(), "substitute-only path invalidated");
                self.invalidate_path_txn(&mut txn, &path)?;
            }
        }
        txn.commit()
    }
}
