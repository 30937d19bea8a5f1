//! Store roots and settings.
//!
//! Roots resolve from environment overrides with compiled defaults; free-form
//! settings come from `<conf_dir>/store.conf` (`key = value` lines, `#`
//! comments). The component store root must sit on a plain directory chain:
//! a symlinked ancestor breaks the path-identity assumption unless the
//! escape-hatch variable is set.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use strata_error::{Result, StrataError};

/// Environment variable that, when non-empty, designates a remote store and
/// forbids instantiating the local engine.
pub const REMOTE_VAR: &str = "STRATA_REMOTE";

/// Escape hatch for stores deliberately reached through a symlink.
pub const IGNORE_SYMLINK_VAR: &str = "STRATA_IGNORE_SYMLINK_STORE";

/// Default size of the garbage-collector scratch file.
pub const DEFAULT_RESERVED_SPACE: u64 = 1024 * 1024;

/// Filesystem layout and settings for one store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Root holding component paths.
    pub store_root: PathBuf,
    /// Root holding state paths, on the versioning filesystem.
    pub state_root: PathBuf,
    /// Root holding the metadata database, schema file, and reserved file.
    pub db_root: PathBuf,
    /// Directory holding the signing key pair and `store.conf`.
    pub conf_dir: PathBuf,
}

impl StoreConfig {
    /// Resolve roots from `STRATA_STORE_DIR` and friends, falling back to the
    /// compiled defaults.
    pub fn from_env() -> StoreConfig {
        fn dir(var: &str, default: &str) -> PathBuf {
            env::var_os(var)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        }
        StoreConfig {
            store_root: dir("STRATA_STORE_DIR", "/strata/store"),
            state_root: dir("STRATA_STATE_DIR", "/strata/state"),
            db_root: dir("STRATA_DB_DIR", "/strata/var/db"),
            conf_dir: dir("STRATA_CONF_DIR", "/etc/strata"),
        }
    }

    /// Layout rooted under one base directory. Test fixtures use this.
    pub fn under(base: &Path) -> StoreConfig {
        StoreConfig {
            store_root: base.join("store"),
            state_root: base.join("state"),
            db_root: base.join("db"),
            conf_dir: base.join("etc"),
        }
    }

    /// Look up a free-form setting from `store.conf`.
    pub fn setting(&self, key: &str) -> Option<String> {
        let conf = self.conf_dir.join("store.conf");
        let contents = fs::read_to_string(conf).ok()?;
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            if k.trim() == key {
                return Some(v.trim().to_owned());
            }
        }
        None
    }

    /// Size of the reserved scratch file (`gc-reserved-space`, default 1 MiB).
    pub fn reserved_space(&self) -> u64 {
        self.setting("gc-reserved-space")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RESERVED_SPACE)
    }

    /// Path of the signing secret key.
    pub fn signing_key(&self) -> PathBuf {
        self.conf_dir.join("signing-key.sec")
    }

    /// Path of the signing public key.
    pub fn public_key(&self) -> PathBuf {
        self.conf_dir.join("signing-key.pub")
    }
}

/// Refuse a store root with a symlink anywhere on its ancestor chain, unless
/// the escape hatch is set.
pub fn check_store_not_symlink(store_root: &Path) -> Result<()> {
    if env::var(IGNORE_SYMLINK_VAR).as_deref() == Ok("1") {
        return Ok(());
    }
    let mut path = store_root;
    loop {
        if let Ok(meta) = fs::symlink_metadata(path) {
            if meta.file_type().is_symlink() {
                return Err(StrataError::StoreSymlink {
                    path: path.to_owned(),
                });
            }
        }
        match path.parent() {
            Some(parent) if parent != path => path = parent,
            _ => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_parse_key_value_lines() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::under(dir.path());
        fs::create_dir_all(&cfg.conf_dir).unwrap();
        fs::write(
            cfg.conf_dir.join("store.conf"),
            "# comment\ngc-reserved-space = 4096\nother=x\n",
        )
        .unwrap();
        assert_eq!(cfg.setting("gc-reserved-space").as_deref(), Some("4096"));
        assert_eq!(cfg.reserved_space(), 4096);
        assert_eq!(cfg.setting("missing"), None);
    }

    #[test]
    fn reserved_space_defaults_without_conf() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::under(dir.path());
        assert_eq!(cfg.reserved_space(), DEFAULT_RESERVED_SPACE);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_store_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        let link = dir.path().join("link");
        fs::create_dir_all(&real).unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = check_store_not_symlink(&link.join("store")).unwrap_err();
        assert!(matches!(err, StrataError::StoreSymlink { .. }));

        // A plain chain passes.
        check_store_not_symlink(&real.join("store")).unwrap();
    }
}
