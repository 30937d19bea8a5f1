//! Substitute records: externally fetchable alternatives to rebuilding.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// An alternative way to realise a component path: a command-line invocation
/// that can materialise it, plus the recipe it came from.
///
/// Equality deliberately ignores the deriver: two substitutes invoking the
/// same program with the same arguments realise the same bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Substitute {
    /// Recipe the substitute was registered for ("" if unknown).
    pub deriver: PathBuf,
    /// Program to invoke.
    pub program: String,
    /// Arguments to pass.
    pub args: Vec<String>,
}

impl PartialEq for Substitute {
    fn eq(&self, other: &Self) -> bool {
        self.program == other.program && self.args == other.args
    }
}

impl Eq for Substitute {}
