use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for strata store operations.
///
/// Structured variants for the conditions callers are expected to match on;
/// `Io` wraps every failed OS call with its errno context.
#[derive(Error, Debug)]
pub enum StrataError {
    // === Registry ===
    /// Component path is absent from the valid-path registry.
    #[error("path `{path}` is not valid")]
    NotValid { path: PathBuf },

    /// State path is absent from the valid-state registry.
    #[error("state path `{path}` is not valid")]
    NotValidState { path: PathBuf },

    /// Path is neither valid nor backed by a substitute.
    #[error("path `{path}` is invalid and has no substitutes")]
    NotRealisable { path: PathBuf },

    /// A validity row exists but its hash value cannot be parsed.
    #[error("corrupt hash `{entry}` in valid-path entry for `{path}`")]
    CorruptHashEntry { path: PathBuf, entry: String },

    /// Deletion attempted while a valid referrer exists.
    #[error("cannot delete path `{path}` because it is in use by path `{referrer}`")]
    PathInUse { path: PathBuf, referrer: PathBuf },

    // === Naming ===
    /// Name violates the store charset or starts with a dot.
    #[error("illegal name: `{name}`")]
    InvalidName { name: String },

    /// Path does not have component-path shape under the store root.
    #[error("path `{path}` is not in the component store")]
    NotStorePath { path: PathBuf },

    /// Path does not have state-path shape under the state root.
    #[error("path `{path}` is not in the state store")]
    NotStatePath { path: PathBuf },

    /// A recipe declared a state path that C1 recomputation does not produce.
    #[error("declared state path `{declared}` does not match computed `{computed}`")]
    SpoofedStatePath { declared: PathBuf, computed: PathBuf },

    // === Content ===
    /// Recomputed digest differs from the recorded or declared digest.
    #[error("hash mismatch for `{path}`: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Top-level path ownership could not be canonicalised to the caller.
    #[error("wrong ownership of top-level store path `{path}`")]
    WrongOwnership { path: PathBuf },

    // === Revisions & sharing ===
    /// Revision lookup on a state path has no record.
    #[error("state path `{path}` has no revision {revision}")]
    NoSuchRevision { path: PathBuf, revision: u64 },

    /// Registering the alias would make the shared-state graph cyclic.
    #[error("sharing `{to}` with `{from}` would create an alias cycle")]
    AliasCycle { from: PathBuf, to: PathBuf },

    /// A state path has no commit-interval counter recorded.
    #[error("state path `{path}` has no interval counter")]
    NoIntervalCounter { path: PathBuf },

    // === Recipes & substitutes ===
    /// A recipe file could not be parsed or lacks a required field.
    #[error("recipe `{path}` is malformed: {detail}")]
    Recipe { path: PathBuf, detail: String },

    /// A substitute row carried the current version but the wrong shape.
    #[error("malformed substitute record: {detail}")]
    MalformedSubstitute { detail: String },

    // === Export / import ===
    /// Import required a signature but the envelope carried none.
    #[error("imported archive lacks a signature")]
    SignatureMissing,

    /// The envelope signature does not cover the received bytes.
    #[error("signed hash does not match actual contents of imported archive")]
    SignatureMismatch,

    /// A signing key is readable by group or other.
    #[error("key file `{path}` should be secret (inaccessible to everybody else)")]
    KeyNotSecret { path: PathBuf },

    /// The byte stream is not a well-formed archive or export envelope.
    #[error("bad archive: {detail}")]
    BadArchive { detail: String },

    // === Store lifecycle ===
    /// Schema file holds a version newer than this engine supports.
    #[error("store schema is version {found}, but only versions up to {supported} are supported")]
    UnsupportedSchema { found: u32, supported: u32 },

    /// Schema file exists but does not hold a decimal version.
    #[error("schema file `{path}` is corrupt")]
    SchemaCorrupt { path: PathBuf },

    /// A remote store is configured; the local engine must not be instantiated.
    #[error("a remote store is configured (`{value}`); refusing to open the local store")]
    RemoteConfigured { value: String },

    /// The store root or one of its ancestors is a symlink.
    #[error("the path `{path}` is a symlink; this is not allowed for the store and its parent directories")]
    StoreSymlink { path: PathBuf },

    /// Mutation attempted on a store opened without write permission.
    #[error("the store is read-only")]
    ReadOnly,

    /// The metadata database is not a well-formed snapshot.
    #[error("metadata database `{path}` is corrupt: {detail}")]
    DatabaseCorrupt { path: PathBuf, detail: String },

    // === Control ===
    /// The current operation observed the interrupt flag.
    #[error("interrupted")]
    Interrupted,

    /// An external helper program failed.
    #[error("program `{program}` failed: {detail}")]
    ProgramFailure { program: String, detail: String },

    /// Underlying OS call failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal invariant was violated. Indicates a bug in the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Wrap an I/O error with the path it concerned.
    pub fn io_at(err: std::io::Error, path: &std::path::Path) -> Self {
        StrataError::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {err}", path.display()),
        ))
    }

    /// Internal invariant violation.
    pub fn internal(msg: impl Into<String>) -> Self {
        StrataError::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = StrataError::NotValid {
            path: PathBuf::from("/s/store/abc-foo"),
        };
        assert_eq!(err.to_string(), "path `/s/store/abc-foo` is not valid");

        let err = StrataError::UnsupportedSchema {
            found: 9,
            supported: 3,
        };
        assert!(err.to_string().contains("version 9"));
    }

    #[test]
    fn io_at_keeps_kind() {
        let inner = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StrataError::io_at(inner, std::path::Path::new("/s/db"));
        match err {
            StrataError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::PermissionDenied),
            other => panic!("unexpected error: {other}"),
        }
    }
}
