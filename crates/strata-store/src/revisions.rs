//! The revision & snapshot index.
//!
//! A revision of a root state path is a consistent cut: every state path
//! reachable from it pinned to one timestamp. Committing mints `prev + 1`
//! for each member and records, per member, the full closure map (so any
//! member can later be queried as a root) and the member's per-subfolder
//! snapshot vector, ordered by subfolder path. Reverting is a metadata
//! lookup plus one revert-to-timestamp call per member.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use strata_error::{Result, StrataError};
use strata_kv::{merge_key, pack_strings, split_key, unpack_strings, Transaction};
use strata_types::{Revision, Timestamp};

use crate::registry::key;
use crate::store::{LocalStore, Reader};

/// What one `commit_state_path` call produced for one member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateCommit {
    /// Timestamp the member's whole tree was captured under; this is what a
    /// revision pins and what revert restores.
    pub pinned: Timestamp,
    /// Per-subfolder snapshot timestamps, ordered by subfolder path.
    pub snapshots: Vec<Timestamp>,
}

/// A materialised cut: the closure map plus each member's snapshot vector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RevisionClosure {
    /// Closure member → pinned timestamp.
    pub members: BTreeMap<PathBuf, Timestamp>,
    /// Closure member → per-subfolder snapshot timestamps.
    pub snapshots: BTreeMap<PathBuf, Vec<Timestamp>>,
}

/// Summary row for one available revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevisionInfo {
    pub revision: Revision,
    pub comment: String,
}

impl LocalStore {
    /// The timestamp revision `revision` pins for `path`, which must be a
    /// non-shared tip. This is the only bridge between revision numbers and
    /// timestamps.
    pub(crate) fn revision_to_timestamp_in(
        &self,
        r: &Reader<'_, '_>,
        path: &Path,
        revision: Revision,
    ) -> Result<Timestamp> {
        let no_such = || StrataError::NoSuchRevision {
            path: path.to_owned(),
            revision: revision.get(),
        };
        let row = r.get_list(self.tables.revisions, &merge_key(path, revision.get()));
        if row.is_empty() {
            return Err(no_such());
        }
        for packed in &row {
            let fields = unpack_strings(packed)?;
            if fields.len() == 3 && Path::new(&fields[0]) == path {
                let ts: u64 = fields[1].parse().map_err(|_| no_such())?;
                return Ok(Timestamp(ts));
            }
        }
        Err(no_such())
    }

    pub fn revision_to_timestamp(&self, path: &Path, revision: Revision) -> Result<Timestamp> {
        let r = self.reader();
        let tip = self.to_non_shared_in(&r, path);
        self.revision_to_timestamp_in(&r, &tip, revision)
    }

    /// Largest revision recorded for `path` (zero when none).
    fn last_revision_in(&self, r: &Reader<'_, '_>, path: &Path) -> Revision {
        let mut best = 0u64;
        for row_key in r.enumerate(self.tables.revisions) {
            if let Some((p, rev)) = split_key(&row_key) {
                if p == path && rev > best {
                    best = rev;
                }
            }
        }
        Revision(best)
    }

    // -----------------------------------------------------------------------
    // Committing cuts
    // -----------------------------------------------------------------------

    /// Record a consistent cut over `commits` rooted at `root`, minting
    /// `prev + 1` for every member. The comment attaches to the root's new
    /// revision.
    pub fn set_state_revisions_txn(
        &self,
        txn: &mut Transaction<'_>,
        commits: &BTreeMap<PathBuf, StateCommit>,
        root: &Path,
        comment: &str,
    ) -> Result<()> {
        // Resolve members to their tips and mint each member's next
        // revision before writing anything.
        let mut minted: BTreeMap<PathBuf, (Revision, &StateCommit)> = BTreeMap::new();
        {
            let r = Reader::Txn(txn);
            for (member, commit) in commits {
                let tip = self.to_non_shared_in(&r, member);
                let next = self.last_revision_in(&r, &tip).next();
                minted.insert(tip, (next, commit));
            }
        }

        // One closure row per member: every member can serve as a query
        // root for this cut. Fields per entry: member, pinned ts, member's
        // revision in this cut.
        let closure_row: Vec<String> = minted
            .iter()
            .map(|(member, (rev, commit))| {
                pack_strings(&[
                    key(member),
                    commit.pinned.get().to_string(),
                    rev.get().to_string(),
                ])
            })
            .collect();

        for (member, (rev, commit)) in &minted {
            let row_key = merge_key(member, rev.get());
            txn.set_list(self.tables.revisions, &row_key, closure_row.clone());
            txn.set_list(
                self.tables.snapshots,
                &row_key,
                commit.snapshots.iter().map(|t| t.get().to_string()).collect(),
            );
            debug!(
                member = %member.display(),
                revision = rev.get(),
                timestamp = commit.pinned.get(),
                "recorded state revision"
            );
        }

        if !comment.is_empty() {
            let root_tip = {
                let r = Reader::Txn(txn);
                self.to_non_shared_in(&r, root)
            };
            if let Some((rev, _)) = minted.get(&root_tip) {
                txn.set(
                    self.tables.revision_comments,
                    &merge_key(&root_tip, rev.get()),
                    comment,
                );
            }
        }
        Ok(())
    }

    pub fn set_state_revisions(
        &self,
        commits: &BTreeMap<PathBuf, StateCommit>,
        root: &Path,
        comment: &str,
    ) -> Result<()> {
        let mut txn = self.db.transaction()?;
        self.set_state_revisions_txn(&mut txn, commits, root, comment)?;
        txn.commit()
    }

    // -----------------------------------------------------------------------
    // Querying cuts
    // -----------------------------------------------------------------------

    /// Parse the closure row recorded at `(tip, rev)` into
    /// `(member, pinned timestamp, member's revision in this cut)` entries.
    fn read_cut(
        &self,
        r: &Reader<'_, '_>,
        tip: &Path,
        rev: Revision,
    ) -> Result<Vec<(PathBuf, Timestamp, Revision)>> {
        let row = r.get_list(self.tables.revisions, &merge_key(tip, rev.get()));
        if row.is_empty() {
            return Err(StrataError::NoSuchRevision {
                path: tip.to_owned(),
                revision: rev.get(),
            });
        }
        let mut entries = Vec::with_capacity(row.len());
        for packed in &row {
            let fields = unpack_strings(packed)?;
            if fields.len() != 3 {
                return Err(StrataError::internal(format!(
                    "revision row for `{}` has {} fields",
                    tip.display(),
                    fields.len()
                )));
            }
            let pinned: u64 = fields[1].parse().map_err(|_| {
                StrataError::internal("revision row carries a non-numeric timestamp")
            })?;
            let member_rev: u64 = fields[2].parse().map_err(|_| {
                StrataError::internal("revision row carries a non-numeric revision")
            })?;
            entries.push((
                PathBuf::from(&fields[0]),
                Timestamp(pinned),
                Revision(member_rev),
            ));
        }
        Ok(entries)
    }

    /// The cut recorded for `(path, revision)`. The latest-revision sentinel
    /// resolves to the newest cut, or `None` when the path has never been
    /// committed; an explicit unknown revision is an error.
    pub fn query_state_revisions(
        &self,
        path: &Path,
        revision: Revision,
    ) -> Result<Option<RevisionClosure>> {
        let r = self.reader();
        let tip = self.to_non_shared_in(&r, path);

        let rev = if revision.is_latest() {
            let last = self.last_revision_in(&r, &tip);
            if last.get() == 0 {
                return Ok(None);
            }
            last
        } else {
            revision
        };

        let mut closure = RevisionClosure::default();
        for (member, pinned, member_rev) in self.read_cut(&r, &tip, rev)? {
            let snapshots = r
                .get_list(self.tables.snapshots, &merge_key(&member, member_rev.get()))
                .iter()
                .filter_map(|s| s.parse().ok().map(Timestamp))
                .collect();
            closure.snapshots.insert(member.clone(), snapshots);
            closure.members.insert(member, pinned);
        }
        Ok(Some(closure))
    }

    /// All revisions recorded for `path`, oldest first, with comments.
    pub fn query_available_state_revisions(&self, path: &Path) -> Result<Vec<RevisionInfo>> {
        let r = self.reader();
        let tip = self.to_non_shared_in(&r, path);
        let mut revs: Vec<u64> = r
            .enumerate(self.tables.revisions)
            .into_iter()
            .filter_map(|k| split_key(&k))
            .filter(|(p, _)| *p == tip)
            .map(|(_, rev)| rev)
            .collect();
        revs.sort_unstable();
        Ok(revs
            .into_iter()
            .map(|rev| RevisionInfo {
                revision: Revision(rev),
                comment: r
                    .get(self.tables.revision_comments, &merge_key(&tip, rev))
                    .unwrap_or_default(),
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Filesystem commit & revert
    // -----------------------------------------------------------------------

    /// Snapshot one state path's directory through the versioning
    /// filesystem, honouring its commit-interval counter. Returns the
    /// member's pinned timestamp and subfolder vector for assembly into a
    /// cut.
    pub fn commit_state_path(&self, path: &Path) -> Result<StateCommit> {
        let tip = self.to_non_shared(path);

        if !self.interval_due(&tip)? {
            // Off-interval run: reuse the member's previous cut if there is
            // one; first commits always snapshot.
            if let Some(closure) = self.query_state_revisions(&tip, Revision::LATEST)? {
                if let Some(pinned) = closure.members.get(&tip) {
                    debug!(path = %tip.display(), "commit interval not due, reusing snapshot");
                    return Ok(StateCommit {
                        pinned: *pinned,
                        snapshots: closure.snapshots.get(&tip).cloned().unwrap_or_default(),
                    });
                }
            }
        }

        if !tip.exists() {
            fs::create_dir_all(&tip).map_err(|e| StrataError::io_at(e, &tip))?;
        }

        // Per-subfolder snapshots, ordered by subfolder path.
        let mut subfolders: Vec<PathBuf> = fs::read_dir(&tip)
            .map_err(|e| StrataError::io_at(e, &tip))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.path())
            .collect();
        subfolders.sort();

        let mut snapshots = Vec::with_capacity(subfolders.len());
        for sub in &subfolders {
            self.interrupt().check()?;
            snapshots.push(self.snapshot_fs().snapshot(sub)?);
        }
        let pinned = self.snapshot_fs().snapshot(&tip)?;
        Ok(StateCommit { pinned, snapshots })
    }

    /// Revert `path` (and, when `recursive`, its whole closure) to the cut
    /// pinned by `revision`.
    ///
    /// This is a true rewind: besides restoring each member's directory,
    /// every revision row, snapshot row, comment, and reference cut newer
    /// than the target is dropped, so the latest-revision sentinel resolves
    /// to the reverted cut afterwards.
    pub fn revert_to_revision(
        &self,
        path: &Path,
        revision: Revision,
        recursive: bool,
    ) -> Result<()> {
        let tip = self.to_non_shared(path);
        if revision.is_latest() && self.query_state_revisions(&tip, Revision::LATEST)?.is_none() {
            return Ok(());
        }
        let cut = {
            let r = self.reader();
            let rev = if revision.is_latest() {
                self.last_revision_in(&r, &tip)
            } else {
                revision
            };
            self.read_cut(&r, &tip, rev)?
        };

        let targets: Vec<(PathBuf, Timestamp, Revision)> = if recursive {
            cut
        } else {
            cut.into_iter().filter(|(member, _, _)| *member == tip).collect()
        };

        let mut txn = self.db.transaction()?;
        for (member, pinned, member_rev) in &targets {
            info!(
                member = %member.display(),
                timestamp = pinned.get(),
                "reverting state path"
            );
            self.snapshot_fs().revert(member, *pinned)?;

            // Drop everything newer than the target cut for this member.
            for row_key in txn.enumerate(self.tables.revisions) {
                if let Some((p, rev)) = split_key(&row_key) {
                    if p == *member && rev > member_rev.get() {
                        txn.delete(self.tables.revisions, &row_key);
                        txn.delete(self.tables.snapshots, &row_key);
                        txn.delete(self.tables.revision_comments, &row_key);
                    }
                }
            }
            for table in [self.tables.ref_sc, self.tables.ref_ss] {
                for row_key in txn.enumerate(table) {
                    if let Some((p, t)) = split_key(&row_key) {
                        if p == *member && t > pinned.get() {
                            txn.delete(table, &row_key);
                        }
                    }
                }
            }
        }
        txn.commit()
    }

    // -----------------------------------------------------------------------
    // Commit-interval counters
    // -----------------------------------------------------------------------

    /// Set the commit-interval counter for each path: an interval of `n`
    /// means the underlying directory is snapshotted on every n-th commit.
    pub fn set_state_paths_interval(&self, pairs: &[(PathBuf, u64)]) -> Result<()> {
        let mut txn = self.db.transaction()?;
        for (path, interval) in pairs {
            txn.set(
                self.tables.state_counters,
                &key(path),
                &format!("{interval}:0"),
            );
        }
        txn.commit()
    }

    /// The configured intervals for each path; a path without a counter is
    /// an error.
    pub fn get_state_paths_interval(&self, paths: &[PathBuf]) -> Result<Vec<u64>> {
        let r = self.reader();
        paths
            .iter()
            .map(|p| {
                let row = r.get(self.tables.state_counters, &key(p)).ok_or_else(|| {
                    StrataError::NoIntervalCounter { path: p.clone() }
                })?;
                row.split(':')
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| StrataError::NoIntervalCounter { path: p.clone() })
            })
            .collect()
    }

    /// Advance the commit counter for `path`; true when this commit should
    /// snapshot. Paths without a counter snapshot every time.
    fn interval_due(&self, path: &Path) -> Result<bool> {
        let row = self.reader().get(self.tables.state_counters, &key(path));
        let Some(row) = row else {
            return Ok(true);
        };
        let mut parts = row.split(':');
        let interval: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let count: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let count = count + 1;

        let mut txn = self.db.transaction()?;
        txn.set(
            self.tables.state_counters,
            &key(path),
            &format!("{interval}:{count}"),
        );
        txn.commit()?;

        Ok(interval <= 1 || count % interval == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::registry::ValidPathInfo;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(StoreConfig::under(dir.path()), false).unwrap();
        (dir, store)
    }

    fn register_state(s: &LocalStore, name: &str) -> PathBuf {
        let p = s.config().state_root.join(name);
        s.register_valid_path(&ValidPathInfo::state(p.clone(), PathBuf::new()))
            .unwrap();
        p
    }

    fn commit_cut(s: &LocalStore, members: &[&PathBuf], root: &PathBuf, comment: &str) {
        let mut commits = BTreeMap::new();
        for m in members {
            commits.insert((*m).clone(), s.commit_state_path(m).unwrap());
        }
        s.set_state_revisions(&commits, root, comment).unwrap();
    }

    #[test]
    fn revisions_are_gap_free_and_monotone() {
        let (_d, s) = store();
        let st = register_state(&s, "aaa-app-default");
        fs::create_dir_all(&st).unwrap();

        for _ in 0..3 {
            commit_cut(&s, &[&st], &st, "");
        }
        let revs = s.query_available_state_revisions(&st).unwrap();
        let numbers: Vec<u64> = revs.iter().map(|i| i.revision.get()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn cuts_record_every_member_and_comments_attach_to_the_root() {
        let (_d, s) = store();
        let a = register_state(&s, "aaa-app-default");
        let b = register_state(&s, "bbb-lib-default");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();

        commit_cut(&s, &[&a, &b], &a, "first cut");

        let closure = s
            .query_state_revisions(&a, Revision::LATEST)
            .unwrap()
            .unwrap();
        assert_eq!(closure.members.len(), 2);
        assert!(closure.members.contains_key(&a));
        assert!(closure.members.contains_key(&b));

        // The same cut is visible from the other member.
        let from_b = s
            .query_state_revisions(&b, Revision::LATEST)
            .unwrap()
            .unwrap();
        assert_eq!(from_b.members, closure.members);

        let infos = s.query_available_state_revisions(&a).unwrap();
        assert_eq!(infos[0].comment, "first cut");
        // No comment on the non-root member.
        let infos_b = s.query_available_state_revisions(&b).unwrap();
        assert_eq!(infos_b[0].comment, "");
    }

    #[test]
    fn unknown_revisions_are_errors() {
        let (_d, s) = store();
        let st = register_state(&s, "aaa-app-default");
        assert!(matches!(
            s.query_state_revisions(&st, Revision(7)),
            Err(StrataError::NoSuchRevision { .. })
        ));
        assert!(matches!(
            s.revision_to_timestamp(&st, Revision(7)),
            Err(StrataError::NoSuchRevision { .. })
        ));
        // Latest on an uncommitted path is simply absent.
        assert!(s
            .query_state_revisions(&st, Revision::LATEST)
            .unwrap()
            .is_none());
    }

    #[test]
    fn revert_restores_the_pinned_content() {
        let (_d, s) = store();
        let st = register_state(&s, "aaa-app-default");
        fs::create_dir_all(st.join("log")).unwrap();

        fs::write(st.join("log/journal"), b"rev1").unwrap();
        commit_cut(&s, &[&st], &st, "r1");

        fs::write(st.join("log/journal"), b"rev2").unwrap();
        commit_cut(&s, &[&st], &st, "r2");

        s.revert_to_revision(&st, Revision(1), true).unwrap();
        assert_eq!(fs::read(st.join("log/journal")).unwrap(), b"rev1");

        // The rewind truncated history: revision 1 is the latest again.
        let revs = s.query_available_state_revisions(&st).unwrap();
        assert_eq!(revs.len(), 1);
        assert_eq!(revs[0].revision, Revision(1));
        assert!(matches!(
            s.revert_to_revision(&st, Revision(2), true),
            Err(StrataError::NoSuchRevision { .. })
        ));

        // History continues from the reverted cut.
        fs::write(st.join("log/journal"), b"rev2b").unwrap();
        commit_cut(&s, &[&st], &st, "r2b");
        let revs = s.query_available_state_revisions(&st).unwrap();
        assert_eq!(revs.last().unwrap().revision, Revision(2));
    }

    #[test]
    fn snapshot_vector_is_ordered_by_subfolder() {
        let (_d, s) = store();
        let st = register_state(&s, "aaa-app-default");
        fs::create_dir_all(st.join("cache")).unwrap();
        fs::create_dir_all(st.join("log")).unwrap();

        let commit = s.commit_state_path(&st).unwrap();
        assert_eq!(commit.snapshots.len(), 2);
        // `cache` sorts before `log`; its snapshot was taken first.
        assert!(commit.snapshots[0] < commit.snapshots[1]);
        assert!(commit.pinned > commit.snapshots[1]);
    }

    #[test]
    fn interval_counters_skip_intermediate_commits() {
        let (_d, s) = store();
        let st = register_state(&s, "aaa-app-default");
        fs::create_dir_all(&st).unwrap();

        // First commit establishes a baseline.
        commit_cut(&s, &[&st], &st, "");
        s.set_state_paths_interval(&[(st.clone(), 2)]).unwrap();
        assert_eq!(s.get_state_paths_interval(&[st.clone()]).unwrap(), vec![2]);

        fs::write(st.join("f"), b"x").unwrap();
        // Count 1: off interval, reuses the old snapshot.
        let off = s.commit_state_path(&st).unwrap();
        // Count 2: due, takes a fresh one.
        let due = s.commit_state_path(&st).unwrap();
        assert!(due.pinned > off.pinned);

        assert!(matches!(
            s.get_state_paths_interval(&[PathBuf::from("/s/state/none")]),
            Err(StrataError::NoIntervalCounter { .. })
        ));
    }
}
