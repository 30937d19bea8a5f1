//! Path naming: deterministic component- and state-path names from the typed
//! digest scheme, plus the lexical shape predicates.
//!
//! A component path is `<store-root>/<digest32>-<name>`; a state path is
//! `<state-root>/<digest32>-<name>-<state-identifier>`. The digest is the
//! base-32 rendering of SHA-256 over a colon-delimited preimage, XOR-folded
//! to 20 bytes. The preimage pins the store root, so a store cannot be
//! transplanted without renaming every path.

use std::path::{Path, PathBuf};

use strata_error::{Result, StrataError};
use strata_types::Sha256Hash;

use crate::archive;
use crate::config::StoreConfig;

/// Characters allowed in a path name besides alphanumerics.
const EXTRA_NAME_CHARS: &str = "+-._?=";

/// Validate the name component of a store or state path.
///
/// Names must not start with `.` (spoofable directory entries) and must stay
/// within `[A-Za-z0-9+\-._?=]`.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') {
        return Err(StrataError::InvalidName {
            name: name.to_owned(),
        });
    }
    for c in name.chars() {
        if !(c.is_ascii_alphanumeric() || EXTRA_NAME_CHARS.contains(c)) {
            return Err(StrataError::InvalidName {
                name: name.to_owned(),
            });
        }
    }
    Ok(())
}

/// Resolve the caller's identity from its real uid. Never taken from input:
/// state path ownership must not be forgeable.
pub fn calling_owner() -> Result<String> {
    let uid = nix::unistd::getuid();
    let user = nix::unistd::User::from_uid(uid)
        .map_err(|e| StrataError::Io(e.into()))?
        .ok_or_else(|| {
            StrataError::Io(std::io::Error::other(format!(
                "uid {uid} has no passwd entry"
            )))
        })?;
    Ok(user.name)
}

fn digest_part(preimage: &str) -> String {
    Sha256Hash::digest(preimage.as_bytes())
        .compress()
        .to_base32()
}

/// Compute a component path from its type tag, content hash, and name.
///
/// `type_` is `"source"`, `"output:out"`, or a `"text"` tag with references
/// folded in (see [`make_text_path`]).
pub fn make_store_path(
    cfg: &StoreConfig,
    type_: &str,
    hash: &Sha256Hash,
    name: &str,
) -> Result<PathBuf> {
    check_name(name)?;
    let preimage = format!(
        "{}:sha256:{}:{}:{}",
        type_,
        hash.to_hex(),
        cfg.store_root.display(),
        name
    );
    Ok(cfg
        .store_root
        .join(format!("{}-{}", digest_part(&preimage), name)))
}

/// Compute the path of a text blob. The references fold into the type tag:
/// the same bytes under a different dependency set must yield a different
/// name.
pub fn make_text_path<P: AsRef<Path>>(
    cfg: &StoreConfig,
    name: &str,
    hash: &Sha256Hash,
    references: impl IntoIterator<Item = P>,
) -> Result<PathBuf> {
    let mut type_ = String::from("text");
    for r in references {
        type_.push(':');
        type_.push_str(&r.as_ref().display().to_string());
    }
    make_store_path(cfg, &type_, hash, name)
}

/// Compute the path of a fixed-output component.
pub fn make_fixed_output_path(
    cfg: &StoreConfig,
    recursive: bool,
    hash: &Sha256Hash,
    name: &str,
) -> Result<PathBuf> {
    let inner = format!(
        "fixed:out:{}sha256:{}:",
        if recursive { "r:" } else { "" },
        hash.to_hex()
    );
    make_store_path(cfg, "output:out", &Sha256Hash::digest(inner.as_bytes()), name)
}

/// Compute a state path for an explicit owner. Only the recipe spoof check
/// may supply the owner; everything else goes through [`make_state_path`].
pub fn make_state_path_for_owner(
    cfg: &StoreConfig,
    component_hash: &str,
    name: &str,
    state_identifier: &str,
    owner: &str,
) -> Result<PathBuf> {
    check_name(name)?;
    check_name(state_identifier)?;
    let preimage = format!(
        ":sha256:{}:{}:{}:{}:{}",
        component_hash,
        cfg.state_root.display(),
        name,
        state_identifier,
        owner
    );
    Ok(cfg.state_root.join(format!(
        "{}-{}-{}",
        digest_part(&preimage),
        name,
        state_identifier
    )))
}

/// Compute a state path owned by the calling user.
pub fn make_state_path(
    cfg: &StoreConfig,
    component_hash: &str,
    name: &str,
    state_identifier: &str,
) -> Result<PathBuf> {
    let owner = calling_owner()?;
    make_state_path_for_owner(cfg, component_hash, name, state_identifier, &owner)
}

/// Compute the component path a filesystem object would be ingested at, plus
/// the content hash to record for it.
pub fn compute_store_path_for_path(
    cfg: &StoreConfig,
    src: &Path,
    fixed: bool,
    recursive: bool,
) -> Result<(PathBuf, Sha256Hash)> {
    let hash = archive::hash_path(src)?;
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dst = if fixed {
        let fixed_hash = if recursive {
            hash
        } else {
            archive::hash_file(src)?
        };
        make_fixed_output_path(cfg, recursive, &fixed_hash, &name)?
    } else {
        make_store_path(cfg, "source", &hash, &name)?
    };
    Ok((dst, hash))
}

/// Compute the component path a text blob would be ingested at.
pub fn compute_store_path_for_text<P: AsRef<Path>>(
    cfg: &StoreConfig,
    name: &str,
    contents: &str,
    references: impl IntoIterator<Item = P>,
) -> Result<PathBuf> {
    make_text_path(cfg, name, &Sha256Hash::digest(contents.as_bytes()), references)
}

fn is_under(root: &Path, path: &Path) -> bool {
    match path.strip_prefix(root) {
        Ok(rest) => path.is_absolute() && !rest.as_os_str().is_empty(),
        Err(_) => false,
    }
}

fn is_direct_child(root: &Path, path: &Path) -> bool {
    is_under(root, path)
        && path
            .strip_prefix(root)
            .map(|rest| rest.components().count() == 1)
            .unwrap_or(false)
}

/// Is `path` anywhere under the component store root?
pub fn is_in_store(cfg: &StoreConfig, path: &Path) -> bool {
    is_under(&cfg.store_root, path)
}

/// Is `path` a component path proper (a direct child of the store root)?
pub fn is_store_path(cfg: &StoreConfig, path: &Path) -> bool {
    is_direct_child(&cfg.store_root, path)
}

/// Is `path` anywhere under the state root?
pub fn is_in_state_store(cfg: &StoreConfig, path: &Path) -> bool {
    is_under(&cfg.state_root, path)
}

/// Is `path` a state path proper (a direct child of the state root)?
pub fn is_state_path(cfg: &StoreConfig, path: &Path) -> bool {
    is_direct_child(&cfg.state_root, path)
}

pub fn assert_store_path(cfg: &StoreConfig, path: &Path) -> Result<()> {
    if is_store_path(cfg, path) {
        Ok(())
    } else {
        Err(StrataError::NotStorePath {
            path: path.to_owned(),
        })
    }
}

pub fn assert_state_path(cfg: &StoreConfig, path: &Path) -> Result<()> {
    if is_state_path(cfg, path) {
        Ok(())
    } else {
        Err(StrataError::NotStatePath {
            path: path.to_owned(),
        })
    }
}

/// Truncate a path inside the store to the component path containing it.
pub fn to_store_path(cfg: &StoreConfig, path: &Path) -> Result<PathBuf> {
    if !is_in_store(cfg, path) {
        return Err(StrataError::NotStorePath {
            path: path.to_owned(),
        });
    }
    let rest = path.strip_prefix(&cfg.store_root).expect("checked prefix");
    let first = rest.components().next().expect("non-empty tail");
    Ok(cfg.store_root.join(first))
}
