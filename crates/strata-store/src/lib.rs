//! Metadata and reference-tracking engine for a content-addressed store.
//!
//! The engine records which component paths are valid (produced by a
//! successful build), the reference graph between immutable component paths
//! and mutable state paths, the revision/snapshot index that lets a state
//! path be rewound to a historical consistent cut, shared-state aliasing,
//! the deriver and substitute indexes, the ingestion pipeline with per-path
//! locking, a canonical archive codec with signed export, and a whole-store
//! verifier.
//!
//! Everything hangs off [`LocalStore`], created once at startup via
//! [`LocalStore::open`] and passed by reference; there is no module-level
//! mutable state.

pub mod archive;
pub mod canonicalise;
pub mod closure;
pub mod config;
pub mod derivers;
pub mod export;
pub mod ingest;
pub mod locks;
pub mod paths;
pub mod recipe;
pub mod refs;
pub mod registry;
pub mod revisions;
pub mod scan;
pub mod shared;
pub mod snapshots;
pub mod store;
pub mod verify;

pub use config::StoreConfig;
pub use locks::PathLocks;
pub use recipe::{Recipe, StateOutput};
pub use refs::RefKind;
pub use registry::ValidPathInfo;
pub use revisions::{RevisionClosure, RevisionInfo, StateCommit};
pub use scan::scan_for_references;
pub use snapshots::{DirSnapshotFs, SnapshotFs};
pub use store::LocalStore;
pub use verify::{VerifyReport, SCHEMA_VERSION};

pub use strata_error::{Result, StrataError};
pub use strata_types::{Interrupt, Revision, Sha256Hash, Substitute, Timestamp};
