//! The recipe extraction contract.
//!
//! A recipe is itself a component path whose contents are a JSON document.
//! The engine never interprets a recipe beyond the declared fields below:
//! the output map, whether a state output exists, and for state outputs the
//! `(state_identifier, owner, component_hash, state_path)` tuple. The
//! declared state path must match the recomputation from those fields, or
//! the recipe is trying to spoof another user's state directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use strata_error::{Result, StrataError};

use crate::config::StoreConfig;
use crate::paths;

/// File extension distinguishing recipes from other component paths.
pub const RECIPE_EXT: &str = "recipe";

/// A declared state output of a recipe.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateOutput {
    pub state_identifier: String,
    pub owner: String,
    pub component_hash: String,
    pub state_path: PathBuf,
}

/// The declared fields of a build recipe.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipe {
    /// Name shared by the recipe's outputs.
    pub name: String,
    /// Declared component outputs, keyed by output name.
    pub outputs: BTreeMap<String, PathBuf>,
    /// Declared state outputs, keyed by output name. Empty for stateless
    /// recipes.
    #[serde(default)]
    pub state_outputs: BTreeMap<String, StateOutput>,
}

impl Recipe {
    /// Does this recipe declare a state output?
    pub fn is_state_recipe(&self) -> bool {
        !self.state_outputs.is_empty()
    }

    /// The `"state"` output, which every state-bearing recipe must declare.
    pub fn state_output(&self, at: &Path) -> Result<&StateOutput> {
        self.state_outputs
            .get("state")
            .ok_or_else(|| StrataError::Recipe {
                path: at.to_owned(),
                detail: "missing `state` output".into(),
            })
    }
}

/// Is `path` shaped like a recipe?
pub fn is_recipe_path(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(RECIPE_EXT)
}

/// Parse the recipe stored at `path`.
pub fn read_recipe(path: &Path) -> Result<Recipe> {
    let contents = fs::read_to_string(path).map_err(|e| StrataError::io_at(e, path))?;
    serde_json::from_str(&contents).map_err(|e| StrataError::Recipe {
        path: path.to_owned(),
        detail: e.to_string(),
    })
}

/// Serialise a recipe for ingestion via `add_text_to_store`.
pub fn recipe_to_string(recipe: &Recipe) -> Result<String> {
    serde_json::to_string_pretty(recipe).map_err(|e| StrataError::Recipe {
        path: PathBuf::new(),
        detail: e.to_string(),
    })
}

/// Verify that a recipe's declared state path is the one its fields compute
/// to. Fails with [`StrataError::SpoofedStatePath`] on any divergence.
pub fn check_state_path(cfg: &StoreConfig, recipe: &Recipe, at: &Path) -> Result<()> {
    let out = recipe.state_output(at)?;
    let computed = paths::make_state_path_for_owner(
        cfg,
        &out.component_hash,
        &recipe.name,
        &out.state_identifier,
        &out.owner,
    )?;
    if computed != out.state_path {
        return Err(StrataError::SpoofedStatePath {
            declared: out.state_path.clone(),
            computed,
        });
    }
    Ok(())
}
