//! Store verifier and schema migration.
//!
//! The verifier reconciles the registry with the filesystem in one
//! transaction: validity rows without a backing filesystem entry (or with a
//! mis-shaped key) are invalidated, substitute and deriver rows are swept
//! against the realisable set, and reference rows are checked for the
//! closure invariant. Content mismatches and incomplete closures are
//! reported, never auto-repaired. Running the verifier twice in a row makes
//! no changes the second time.
//!
//! The schema file under the database root carries a decimal version.
//! Upgrades run at open time, chunking their commits so a large store does
//! not produce one oversized transaction.

use std::fs;
use std::path::PathBuf;

use tracing::{error, info, warn};

use strata_error::{Result, StrataError};

use crate::archive;
use crate::paths;
use crate::registry::key;
use crate::store::{LocalStore, Reader};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 3;

/// Paths processed between commits during an upgrade.
const UPGRADE_CHUNK: usize = 1000;

/// Name of the legacy inverse-referrer table dropped by the v2→v3 upgrade.
const LEGACY_REFERRERS_TABLE: &str = "referrers";

/// What one verifier run found and changed.
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Valid paths whose filesystem entry has disappeared (invalidated).
    pub missing: Vec<PathBuf>,
    /// Validity rows whose key is not store-shaped (invalidated).
    pub mis_shaped: Vec<PathBuf>,
    /// Contents no longer matching the recorded hash (reported only).
    pub hash_mismatches: Vec<PathBuf>,
    /// Substitute rows dropped (mis-shaped key or empty list).
    pub dropped_substitute_rows: Vec<PathBuf>,
    /// Deriver rows dropped or trimmed.
    pub dropped_deriver_rows: Vec<PathBuf>,
    /// Reference rows cleared for unrealisable keys.
    pub cleared_reference_rows: Vec<PathBuf>,
    /// Valid paths referencing a non-valid path (reported only).
    pub incomplete_closures: Vec<(PathBuf, PathBuf)>,
}

impl VerifyReport {
    /// Number of rows the run actually changed. Reports (hash mismatches,
    /// incomplete closures) do not count: a second run will see them again.
    pub fn changes(&self) -> usize {
        self.missing.len()
            + self.mis_shaped.len()
            + self.dropped_substitute_rows.len()
            + self.dropped_deriver_rows.len()
            + self.cleared_reference_rows.len()
    }
}

impl LocalStore {
    /// Re-establish every registry invariant against the filesystem.
    pub fn verify_store(&self, check_contents: bool) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let mut txn = self.db.transaction()?;

        info!("checking path existence");
        let mut valid: Vec<PathBuf> = Vec::new();
        for k in txn.enumerate(self.tables.valid_components) {
            self.interrupt().check()?;
            let path = PathBuf::from(&k);
            if !path.exists() {
                error!(path = %path.display(), "path has disappeared");
                self.invalidate_path_txn(&mut txn, &path)?;
                report.missing.push(path);
            } else if !paths::is_store_path(self.config(), &path) {
                error!(path = %path.display(), "path is not in the store");
                self.invalidate_path_txn(&mut txn, &path)?;
                report.mis_shaped.push(path);
            } else {
                if check_contents {
                    let expected = self.query_path_hash_in(&Reader::Txn(&txn), &path)?;
                    let current = archive::hash_path(&path)?;
                    if current != expected {
                        error!(
                            path = %path.display(),
                            expected = %expected,
                            actual = %current,
                            "path was modified"
                        );
                        report.hash_mismatches.push(path.clone());
                    }
                }
                valid.push(path);
            }
        }

        info!("checking path realisability");
        let mut realisable: Vec<PathBuf> = valid.clone();
        for k in txn.enumerate(self.tables.substitutes) {
            self.interrupt().check()?;
            let path = PathBuf::from(&k);
            if !paths::is_store_path(self.config(), &path) {
                warn!(path = %path.display(), "removing substitutes for non-store path");
                txn.delete(self.tables.substitutes, &k);
                report.dropped_substitute_rows.push(path);
            } else if self.read_substitutes_in(&Reader::Txn(&txn), &path)?.is_empty() {
                txn.delete(self.tables.substitutes, &k);
                report.dropped_substitute_rows.push(path);
            } else {
                realisable.push(path);
            }
        }

        info!("checking the derivers table");
        for k in txn.enumerate(self.tables.derivers) {
            self.interrupt().check()?;
            let path = PathBuf::from(&k);
            if !realisable.contains(&path) {
                warn!(path = %path.display(), "removing deriver entry for unrealisable path");
                txn.delete(self.tables.derivers, &k);
                report.dropped_deriver_rows.push(path);
                continue;
            }
            let values = txn.get_list(self.tables.derivers, &k);
            let kept: Vec<String> = values
                .iter()
                .filter(|v| paths::is_store_path(self.config(), std::path::Path::new(v)))
                .cloned()
                .collect();
            if kept.len() != values.len() {
                warn!(path = %path.display(), "removing corrupt deriver values");
                if kept.is_empty() {
                    txn.delete(self.tables.derivers, &k);
                } else {
                    txn.set_list(self.tables.derivers, &k, kept);
                }
                report.dropped_deriver_rows.push(path);
            }
        }

        info!("checking the references table");
        for k in txn.enumerate(self.tables.ref_cc) {
            self.interrupt().check()?;
            let path = PathBuf::from(&k);
            if !realisable.contains(&path) {
                warn!(path = %path.display(), "clearing references of unrealisable path");
                txn.delete(self.tables.ref_cc, &k);
                txn.delete(self.tables.ref_cs, &k);
                report.cleared_reference_rows.push(path);
                continue;
            }
            if valid.contains(&path) {
                for reference in txn.get_list(self.tables.ref_cc, &k) {
                    let reference = PathBuf::from(&reference);
                    if !self.is_valid_path_txn(&txn, &reference) {
                        error!(
                            path = %path.display(),
                            missing = %reference.display(),
                            "incomplete closure"
                        );
                        report.incomplete_closures.push((path.clone(), reference));
                    }
                }
            }
        }

        txn.commit()?;
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    /// Read the schema file, upgrade old stores, refuse newer ones, and
    /// stamp fresh ones. Runs once at open time.
    pub(crate) fn check_schema(&self) -> Result<()> {
        let schema_file = self.config().db_root.join("schema");

        let current: u32 = match fs::read_to_string(&schema_file) {
            Ok(s) => s
                .trim()
                .parse()
                .map_err(|_| StrataError::SchemaCorrupt {
                    path: schema_file.clone(),
                })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StrataError::io_at(e, &schema_file)),
        };

        if current > SCHEMA_VERSION {
            return Err(StrataError::UnsupportedSchema {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < SCHEMA_VERSION {
            if current > 0 {
                info!(from = current, to = SCHEMA_VERSION, "upgrading store schema");
            }
            if current == 1 {
                self.upgrade_rehash()?;
            }
            if current == 1 || current == 2 {
                self.db.delete_table(LEGACY_REFERRERS_TABLE)?;
            }
            fs::write(&schema_file, SCHEMA_VERSION.to_string())
                .map_err(|e| StrataError::io_at(e, &schema_file))?;
        }
        Ok(())
    }

    /// v1 stores recorded validity without hashes; rehash every such path
    /// from disk, committing in chunks.
    fn upgrade_rehash(&self) -> Result<()> {
        let keys = self.db.enumerate(self.tables.valid_components);
        let mut txn = self.db.transaction()?;
        let mut processed = 0usize;

        for k in keys {
            self.interrupt().check()?;
            let path = PathBuf::from(&k);
            let value = txn.get(self.tables.valid_components, &k).unwrap_or_default();
            if value.is_empty() && path.exists() {
                let hash = archive::hash_path(&path)?;
                txn.set(
                    self.tables.valid_components,
                    &key(&path),
                    &format!("sha256:{}", hash.to_hex()),
                );
            }
            processed += 1;
            if processed % UPGRADE_CHUNK == 0 {
                txn.commit()?;
                txn = self.db.transaction()?;
            }
        }
        txn.commit()
    }
}
