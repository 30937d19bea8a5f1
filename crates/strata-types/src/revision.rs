//! Revision numbers and versioning-filesystem timestamps.
//!
//! A revision is a per-state-path monotone counter naming a consistent cut; a
//! timestamp is the version number the versioning filesystem mints for a
//! directory's content at one point in time. The two are never compared
//! directly: every query translates a revision to a timestamp through the
//! revision index first.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A revision of a state path. `0` is the query sentinel for "latest".
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, Default,
)]
pub struct Revision(pub u64);

impl Revision {
    /// Query sentinel: resolve to the most recent revision.
    pub const LATEST: Revision = Revision(0);

    /// First real revision of a state path.
    pub const FIRST: Revision = Revision(1);

    pub fn is_latest(self) -> bool {
        self.0 == 0
    }

    /// The revision minted after this one.
    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A versioning-filesystem timestamp (seconds since the epoch).
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, Default,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current wall-clock timestamp. Callers needing monotonicity guard it
    /// against the last value they handed out.
    pub fn now() -> Timestamp {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Timestamp(secs)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
