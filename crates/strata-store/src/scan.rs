//! Reference scanning: discover outgoing edges by searching a tree's bytes
//! for the digest components of candidate paths.
//!
//! Scanning looks inside regular files and at symlink targets. It cannot
//! see state reached indirectly (e.g. through a home-directory symlink), so
//! component scans union in the recorded solid state references.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use strata_error::{Result, StrataError};
use strata_types::Revision;

use crate::store::LocalStore;

/// The digest component of a store or state path's base name (everything
/// before the first dash). Too-short digests are skipped: they would match
/// accidentally.
fn digest_needle(path: &Path) -> Option<Vec<u8>> {
    let base = path.file_name()?.to_str()?;
    let digest = base.split('-').next()?;
    if digest.len() < 16 {
        return None;
    }
    Some(digest.as_bytes().to_vec())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.len() <= haystack.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Search the tree at `path` for the digests of `candidates`; return the
/// candidates whose digest occurs.
pub fn scan_for_references(
    path: &Path,
    candidates: &BTreeSet<PathBuf>,
) -> Result<BTreeSet<PathBuf>> {
    let needles: Vec<(&PathBuf, Vec<u8>)> = candidates
        .iter()
        .filter_map(|c| digest_needle(c).map(|n| (c, n)))
        .collect();
    if needles.is_empty() {
        return Ok(BTreeSet::new());
    }

    let mut found = BTreeSet::new();
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| {
            StrataError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk error without io cause")),
            )
        })?;

        let haystack: Vec<u8> = if entry.file_type().is_file() {
            fs::read(entry.path()).map_err(|e| StrataError::io_at(e, entry.path()))?
        } else if entry.file_type().is_symlink() {
            fs::read_link(entry.path())
                .map_err(|e| StrataError::io_at(e, entry.path()))?
                .to_string_lossy()
                .into_owned()
                .into_bytes()
        } else {
            continue;
        };

        for (candidate, needle) in &needles {
            if !found.contains(*candidate) && contains(&haystack, needle) {
                found.insert((*candidate).clone());
            }
        }
        if found.len() == needles.len() {
            break;
        }
    }
    Ok(found)
}

impl LocalStore {
    /// Scan a component path for its references. Solid state references are
    /// unioned in: those edges exist even though scanning cannot see them.
    pub fn scan_component_references(
        &self,
        component: &Path,
    ) -> Result<(BTreeSet<PathBuf>, BTreeSet<PathBuf>)> {
        let (valid_components, valid_states) = self.query_all_valid_paths();
        let mut components = scan_for_references(component, &valid_components)?;
        components.remove(component);
        let mut states = scan_for_references(component, &valid_states)?;
        states.extend(self.query_solid_state_refs(component));
        Ok((components, states))
    }

    /// Rescan one state path and replace its latest reference cut with the
    /// scan result.
    pub fn scan_and_update_all_references(&self, state_path: &Path) -> Result<()> {
        let tip = self.to_non_shared(state_path);
        let (valid_components, valid_states) = self.query_all_valid_paths();

        let components = scan_for_references(&tip, &valid_components)?;
        let mut states = scan_for_references(&tip, &valid_states)?;
        states.remove(&tip);

        debug!(
            path = %tip.display(),
            components = components.len(),
            states = states.len(),
            "rescanned state references"
        );

        let mut txn = self.db.transaction()?;
        self.set_references_txn(&mut txn, &tip, &components, &states, Revision::LATEST)?;
        txn.commit()
    }

    /// Rescan a state path and every state path reachable from it.
    pub fn scan_and_update_all_references_recursively(&self, state_path: &Path) -> Result<()> {
        let mut done: BTreeSet<PathBuf> = BTreeSet::new();
        let mut queue = vec![self.to_non_shared(state_path)];
        while let Some(current) = queue.pop() {
            self.interrupt().check()?;
            if !done.insert(current.clone()) {
                continue;
            }
            self.scan_and_update_all_references(&current)?;
            for next in self.query_state_references(&current, Revision::LATEST)? {
                queue.push(self.to_non_shared(&next));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_digests_in_files_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(&tree).unwrap();

        let hit = PathBuf::from("/s/store/0123456789abcdfghijklmnpqrsvwxyz-hit");
        let link_hit = PathBuf::from("/s/store/zyxwvsrqpnmlkjihgfdcba9876543210-link");
        let miss = PathBuf::from("/s/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-miss");

        fs::write(
            tree.join("conf"),
            b"prefix 0123456789abcdfghijklmnpqrsvwxyz suffix",
        )
        .unwrap();
        std::os::unix::fs::symlink(
            "/s/store/zyxwvsrqpnmlkjihgfdcba9876543210-link/bin",
            tree.join("ln"),
        )
        .unwrap();

        let candidates = BTreeSet::from([hit.clone(), link_hit.clone(), miss]);
        let found = scan_for_references(&tree, &candidates).unwrap();
        assert_eq!(found, BTreeSet::from([hit, link_hit]));
    }

    #[test]
    fn short_digests_never_match() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("f"), b"abc-x appears here").unwrap();

        let candidates = BTreeSet::from([PathBuf::from("/s/store/abc-x")]);
        assert!(scan_for_references(&tree, &candidates).unwrap().is_empty());
    }
}
