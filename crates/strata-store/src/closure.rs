//! Requisite closures over the reference graph.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use strata_error::Result;
use strata_types::Revision;

use crate::recipe;
use crate::store::{LocalStore, PathKind};

impl LocalStore {
    /// The transitive reference closure of `path`, traversing both
    /// component and state edges at `revision`. `with_components` /
    /// `with_state` filter which node kinds are collected; traversal always
    /// crosses both.
    pub fn compute_fs_closure(
        &self,
        path: &Path,
        with_components: bool,
        with_state: bool,
        revision: Revision,
    ) -> Result<BTreeSet<PathBuf>> {
        let mut visited: BTreeSet<PathBuf> = BTreeSet::new();
        let mut queue = vec![path.to_owned()];
        while let Some(current) = queue.pop() {
            self.interrupt().check()?;
            if !visited.insert(current.clone()) {
                continue;
            }
            queue.extend(self.query_references(&current, revision)?);
            queue.extend(self.query_state_references(&current, revision)?);
        }

        Ok(visited
            .into_iter()
            .filter(|p| match self.classify(p) {
                Ok(PathKind::Component) => with_components,
                Ok(PathKind::State) => with_state,
                Err(_) => false,
            })
            .collect())
    }

    /// Everything required to realise `path`: its closure, and with
    /// `include_outputs` also the closures of the valid declared outputs of
    /// any recipes inside it.
    pub fn store_path_requisites(
        &self,
        path: &Path,
        include_outputs: bool,
        with_components: bool,
        with_state: bool,
        revision: Revision,
    ) -> Result<BTreeSet<PathBuf>> {
        let mut paths = self.compute_fs_closure(path, with_components, with_state, revision)?;

        if include_outputs {
            for p in paths.clone() {
                if !recipe::is_recipe_path(&p) {
                    continue;
                }
                let parsed = recipe::read_recipe(&p)?;
                for output in parsed.outputs.values() {
                    if self.is_valid_path(output) {
                        paths.extend(self.compute_fs_closure(
                            output,
                            with_components,
                            with_state,
                            revision,
                        )?);
                    }
                }
            }
        }
        Ok(paths)
    }
}
