//! Signed export/import round-trips through the external RSA tool.
//!
//! These tests need an `openssl` binary; they skip (with a note) when the
//! tool is unavailable.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use strata_store::{LocalStore, Revision, StoreConfig, StrataError};

fn openssl_available() -> bool {
    Command::new("openssl")
        .arg("version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn generate_keypair(conf_dir: &Path) {
    fs::create_dir_all(conf_dir).unwrap();
    let secret = conf_dir.join("signing-key.sec");
    let public = conf_dir.join("signing-key.pub");

    let status = Command::new("openssl")
        .args(["genrsa", "-out"])
        .arg(&secret)
        .arg("2048")
        .output()
        .unwrap();
    assert!(status.status.success(), "key generation failed");
    fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();

    let status = Command::new("openssl")
        .args(["rsa", "-in"])
        .arg(&secret)
        .args(["-pubout", "-out"])
        .arg(&public)
        .output()
        .unwrap();
    assert!(status.status.success(), "public key extraction failed");
}

/// Two stores sharing one store root and one key pair, with separate
/// registries.
struct Fixture {
    _src_dir: tempfile::TempDir,
    _dst_dir: tempfile::TempDir,
    src: LocalStore,
    dst: LocalStore,
}

fn fixture() -> Fixture {
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();

    let src_cfg = StoreConfig::under(src_dir.path());
    generate_keypair(&src_cfg.conf_dir);

    let mut dst_cfg = StoreConfig::under(dst_dir.path());
    dst_cfg.store_root = src_cfg.store_root.clone();
    dst_cfg.conf_dir = src_cfg.conf_dir.clone();

    Fixture {
        src: LocalStore::open(src_cfg, false).unwrap(),
        dst: LocalStore::open(dst_cfg, false).unwrap(),
        _src_dir: src_dir,
        _dst_dir: dst_dir,
    }
}

#[test]
fn signed_roundtrip_preserves_hash_references_and_deriver() {
    if !openssl_available() {
        eprintln!("skipping signed_roundtrip (no openssl binary)");
        return;
    }
    let fx = fixture();

    let scratch = tempfile::tempdir().unwrap();
    fs::write(scratch.path().join("dep"), b"dependency").unwrap();
    fs::write(scratch.path().join("drv"), b"the recipe text").unwrap();
    fs::write(scratch.path().join("app"), b"the application").unwrap();

    let dep = fx.src.add_to_store(&scratch.path().join("dep"), false, true).unwrap();
    let drv = fx.src.add_to_store(&scratch.path().join("drv"), false, true).unwrap();
    let app = fx.src.add_to_store(&scratch.path().join("app"), false, true).unwrap();
    fx.src.set_deriver(&app, &drv).unwrap();
    fx.src
        .set_references(&app, &BTreeSet::from([dep.clone()]), &BTreeSet::new(), Revision::LATEST)
        .unwrap();

    let export = |path| {
        let mut envelope = Vec::new();
        fx.src.export_path(path, true, &mut envelope).unwrap();
        envelope
    };
    let dep_envelope = export(&dep);
    let drv_envelope = export(&drv);
    let app_envelope = export(&app);
    let expected_hash = fx.src.query_path_hash(&app).unwrap();

    // Import the closure, dependencies first, into the fresh registry.
    fx.dst.import_path(true, &mut dep_envelope.as_slice()).unwrap();
    fx.dst.import_path(true, &mut drv_envelope.as_slice()).unwrap();
    let imported = fx.dst.import_path(true, &mut app_envelope.as_slice()).unwrap();

    assert_eq!(imported, app);
    assert!(fx.dst.is_valid_path(&app));
    assert_eq!(fx.dst.query_path_hash(&app).unwrap(), expected_hash);
    assert_eq!(
        fx.dst.query_references(&app, Revision::LATEST).unwrap(),
        BTreeSet::from([dep])
    );
    assert_eq!(fx.dst.query_deriver(&app).unwrap(), Some(drv));
}

#[test]
fn unsigned_envelopes_fail_when_signatures_are_required() {
    if !openssl_available() {
        eprintln!("skipping unsigned_envelopes (no openssl binary)");
        return;
    }
    let fx = fixture();

    let scratch = tempfile::tempdir().unwrap();
    fs::write(scratch.path().join("f"), b"contents").unwrap();
    let p = fx.src.add_to_store(&scratch.path().join("f"), false, true).unwrap();

    let mut envelope = Vec::new();
    fx.src.export_path(&p, false, &mut envelope).unwrap();

    assert!(matches!(
        fx.dst.import_path(true, &mut envelope.as_slice()),
        Err(StrataError::SignatureMissing)
    ));
}

#[test]
fn corrupted_signatures_are_rejected() {
    if !openssl_available() {
        eprintln!("skipping corrupted_signatures (no openssl binary)");
        return;
    }
    let fx = fixture();

    let scratch = tempfile::tempdir().unwrap();
    fs::write(scratch.path().join("f"), b"contents").unwrap();
    let p = fx.src.add_to_store(&scratch.path().join("f"), false, true).unwrap();

    let mut envelope = Vec::new();
    fx.src.export_path(&p, true, &mut envelope).unwrap();

    // Flip one byte inside the trailing signature region.
    let last = envelope.len() - 1;
    envelope[last] ^= 0x01;

    assert!(matches!(
        fx.dst.import_path(true, &mut envelope.as_slice()),
        Err(StrataError::SignatureMismatch)
    ));
}
