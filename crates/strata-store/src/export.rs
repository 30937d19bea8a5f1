//! Signed export envelope and its import counterpart.
//!
//! An export is the canonical archive of the path followed by a trailer:
//! magic, the path itself, its component references at the current cut, its
//! deriver, a signed flag, and optionally an RSA signature over the SHA-256
//! of everything before the flag. State references are deliberately not
//! carried; importers re-derive state wiring from the recipe. Signing and
//! verification shell out to the external `openssl` tool over a scratch
//! file holding the printable hash.

use std::collections::BTreeSet;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use strata_error::{Result, StrataError};
use strata_types::Revision;

use crate::archive::{
    self, read_bytes, read_string, read_string_set, read_u32, write_bytes, write_string,
    write_string_set, write_u32, HashingReader, HashingWriter,
};
use crate::canonicalise::canonicalise_path_meta_data;
use crate::config::StoreConfig;
use crate::ingest::delete_path;
use crate::locks::PathLocks;
use crate::paths;
use crate::registry::{key, ValidPathInfo};
use crate::store::{LocalStore, Reader};

/// Magic number separating the archive from the export trailer.
pub const EXPORT_MAGIC: u32 = 0x4558494e;

/// A signing key must be unreadable by group and other.
fn check_secrecy(path: &Path) -> Result<()> {
    let meta = fs::metadata(path).map_err(|e| StrataError::io_at(e, path))?;
    if meta.permissions().mode() & 0o077 != 0 {
        return Err(StrataError::KeyNotSecret {
            path: path.to_owned(),
        });
    }
    Ok(())
}

fn run_openssl(cmd: &mut Command) -> Result<Vec<u8>> {
    let output = cmd.output().map_err(StrataError::Io)?;
    if !output.status.success() {
        return Err(StrataError::ProgramFailure {
            program: "openssl".into(),
            detail: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output.stdout)
}

/// Sign the printable hash with the store's secret key.
fn sign_hash(cfg: &StoreConfig, hash_hex: &str) -> Result<Vec<u8>> {
    let secret_key = cfg.signing_key();
    check_secrecy(&secret_key)?;

    let scratch = tempfile::tempdir().map_err(StrataError::Io)?;
    let hash_file = scratch.path().join("hash");
    fs::write(&hash_file, hash_hex).map_err(|e| StrataError::io_at(e, &hash_file))?;

    run_openssl(
        Command::new("openssl")
            .args(["rsautl", "-sign", "-inkey"])
            .arg(&secret_key)
            .arg("-in")
            .arg(&hash_file),
    )
}

/// Recover the signed content from a signature using the public key. A
/// signature openssl rejects is a mismatch, not an engine failure.
fn recover_signed_hash(cfg: &StoreConfig, signature: &[u8]) -> Result<String> {
    let scratch = tempfile::tempdir().map_err(StrataError::Io)?;
    let sig_file = scratch.path().join("sig");
    fs::write(&sig_file, signature).map_err(|e| StrataError::io_at(e, &sig_file))?;

    let out = run_openssl(
        Command::new("openssl")
            .args(["rsautl", "-verify", "-inkey"])
            .arg(cfg.public_key())
            .arg("-pubin")
            .arg("-in")
            .arg(&sig_file),
    )
    .map_err(|e| match e {
        StrataError::ProgramFailure { .. } => StrataError::SignatureMismatch,
        other => other,
    })?;
    Ok(String::from_utf8_lossy(&out).trim().to_owned())
}

impl LocalStore {
    /// Serialise `path` with its metadata into `sink`, optionally signed.
    ///
    /// The whole export runs under one transaction so the archive and the
    /// trailer describe the same cut.
    pub fn export_path(&self, path: &Path, sign: bool, sink: &mut impl Write) -> Result<()> {
        paths::assert_store_path(self.config(), path)?;

        let txn = self.db.transaction()?;
        self.add_temp_root(path)?;
        if !self.is_valid_path_txn(&txn, path) {
            return Err(StrataError::NotValid {
                path: path.to_owned(),
            });
        }

        info!(path = %path.display(), signed = sign, "exporting path");
        let mut w = HashingWriter::new(sink);
        archive::dump_path(path, &mut w)?;

        write_u32(&mut w, EXPORT_MAGIC)?;
        write_string(&mut w, &key(path))?;

        let references = self.query_references_txn(&txn, path, Revision::LATEST)?;
        let reference_keys: Vec<String> = references.iter().map(|r| key(r)).collect();
        write_string_set(&mut w, &reference_keys)?;

        // State-bearing components keep their deriver set private to the
        // registry; the envelope carries a single deriver or nothing.
        let deriver = {
            let r = Reader::Txn(&txn);
            if r.contains(self.tables.state_info, &key(path)) {
                String::new()
            } else {
                r.get(self.tables.derivers, &key(path)).unwrap_or_default()
            }
        };
        write_string(&mut w, &deriver)?;

        if sign {
            let hash = w.current_hash();
            w.hashing = false;
            write_u32(&mut w, 1)?;
            let signature = sign_hash(self.config(), &hash.to_hex())?;
            write_bytes(&mut w, &signature)?;
        } else {
            write_u32(&mut w, 0)?;
        }

        txn.commit()
    }

    /// Import an export envelope, verifying its signature when
    /// `require_signature` is set, and ingest the archive at its recorded
    /// path.
    pub fn import_path(&self, require_signature: bool, source: &mut impl Read) -> Result<PathBuf> {
        let mut r = HashingReader::new(source);

        // The store path only follows the archive proper, so restore into a
        // staging directory under the store root; the final installation is
        // a rename on the same filesystem.
        let staging = tempfile::Builder::new()
            .prefix(".import-")
            .tempdir_in(&self.config().store_root)
            .map_err(StrataError::Io)?;
        let unpacked = staging.path().join("unpacked");
        archive::restore_path(&unpacked, &mut r)?;

        if read_u32(&mut r)? != EXPORT_MAGIC {
            return Err(StrataError::BadArchive {
                detail: "missing export magic after archive".into(),
            });
        }

        let dst = PathBuf::from(read_string(&mut r)?);
        paths::assert_store_path(self.config(), &dst)?;

        let mut references: BTreeSet<PathBuf> = BTreeSet::new();
        for reference in read_string_set(&mut r)? {
            let reference = PathBuf::from(reference);
            paths::assert_store_path(self.config(), &reference)?;
            references.insert(reference);
        }

        let deriver_field = read_string(&mut r)?;
        let mut deriver = if deriver_field.is_empty() {
            None
        } else {
            let d = PathBuf::from(deriver_field);
            paths::assert_store_path(self.config(), &d)?;
            Some(d)
        };

        let received_hash = r.current_hash();
        r.hashing = false;

        let have_signature = read_u32(&mut r)? == 1;
        if require_signature && !have_signature {
            return Err(StrataError::SignatureMissing);
        }
        if have_signature {
            let signature = read_bytes(&mut r)?;
            if require_signature {
                let signed_hex = recover_signed_hash(self.config(), &signature)?;
                if signed_hex != received_hash.to_hex() {
                    return Err(StrataError::SignatureMismatch);
                }
                debug!(path = %dst.display(), "import signature verified");
            }
        }

        // A deriver the receiving store has never heard of is dropped, not
        // an error.
        if let Some(d) = &deriver {
            if !self.is_valid_path(d) {
                deriver = None;
            }
        }

        self.add_temp_root(&dst)?;
        if !self.is_valid_path(&dst) {
            let mut lock = PathLocks::lock([dst.clone()], self.interrupt())?;
            lock.set_deletion(true);

            if !self.is_valid_path(&dst) {
                if dst.exists() {
                    delete_path(&dst)?;
                }
                fs::rename(&unpacked, &dst).map_err(|e| StrataError::io_at(e, &dst))?;
                canonicalise_path_meta_data(&dst, self.interrupt())?;

                let hash = archive::hash_path(&dst)?;
                let mut info = ValidPathInfo::component(dst.clone(), hash)
                    .with_references(references, BTreeSet::new());
                if let Some(d) = deriver {
                    info = info.with_deriver(d);
                }
                let mut txn = self.db.transaction()?;
                self.register_valid_path_txn(&mut txn, &info)?;
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

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(StoreConfig::under(dir.path()), false).unwrap();
        (dir, store)
    }

    #[test]
    fn unsigned_export_import_roundtrip() {
        let (dir, src_store) = store();
        let f = dir.path().join("f");
        fs::write(&f, b"hello\n").unwrap();
        let p = src_store.add_to_store(&f, false, true).unwrap();

        let original_hash = src_store.query_path_hash(&p).unwrap();
        let mut envelope = Vec::new();
        src_store.export_path(&p, false, &mut envelope).unwrap();

        // Import into a second store sharing the same store root but a
        // fresh registry.
        let dst_dir = tempfile::tempdir().unwrap();
        let mut cfg = StoreConfig::under(dst_dir.path());
        cfg.store_root = src_store.config().store_root.clone();
        src_store.delete_from_store(&p).unwrap();
        let dst_store = LocalStore::open(cfg, false).unwrap();

        let imported = dst_store
            .import_path(false, &mut envelope.as_slice())
            .unwrap();
        assert_eq!(imported, p);
        assert!(dst_store.is_valid_path(&p));
        assert_eq!(dst_store.query_path_hash(&p).unwrap(), original_hash);
    }

    #[test]
    fn import_without_signature_fails_when_required() {
        let (dir, s) = store();
        let f = dir.path().join("f");
        fs::write(&f, b"unsigned").unwrap();
        let p = s.add_to_store(&f, false, true).unwrap();

        let mut envelope = Vec::new();
        s.export_path(&p, false, &mut envelope).unwrap();
        s.delete_from_store(&p).unwrap();

        let err = s.import_path(true, &mut envelope.as_slice()).unwrap_err();
        assert!(matches!(err, StrataError::SignatureMissing));
    }

    #[test]
    fn truncated_envelopes_are_rejected() {
        let (dir, s) = store();
        let f = dir.path().join("f");
        fs::write(&f, b"short").unwrap();
        let p = s.add_to_store(&f, false, true).unwrap();

        let mut envelope = Vec::new();
        s.export_path(&p, false, &mut envelope).unwrap();
        s.delete_from_store(&p).unwrap();

        envelope.truncate(envelope.len() / 2);
        assert!(s.import_path(false, &mut envelope.as_slice()).is_err());
    }

    #[test]
    fn secret_keys_must_be_secret() {
        let (dir, _s) = store();
        let key_path = dir.path().join("key");
        fs::write(&key_path, b"secret material").unwrap();
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            check_secrecy(&key_path),
            Err(StrataError::KeyNotSecret { .. })
        ));
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600)).unwrap();
        check_secrecy(&key_path).unwrap();
    }
}
