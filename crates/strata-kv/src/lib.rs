//! Transactional table store backing the strata registry.
//!
//! A [`Database`] is a set of named tables mapping string keys to ordered
//! lists of strings. Writes go through a [`Transaction`]: they are buffered
//! in the transaction, visible to its own reads, and become durable in one
//! atomic step on commit (snapshot serialisation to a temp file followed by
//! rename). Readers holding no transaction always observe the last committed
//! snapshot. Overlapping write transactions are serialised by an internal
//! writer lock.
//!
//! The backend intentionally offers no range iteration beyond full-table
//! enumeration; the registry's referrer queries are specified as full scans.

pub mod pack;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use strata_error::{Result, StrataError};

pub use pack::{pack_strings, unpack_strings};

/// Name of the snapshot file inside the database directory.
const SNAPSHOT_FILE: &str = "tables.json";

/// Separator used by composite `(path, number)` keys in revisioned tables.
const KEY_SEPARATOR: &str = "-KEY-";

type Table = BTreeMap<String, Vec<String>>;
type TableMap = BTreeMap<String, Table>;

/// Handle to an open table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TableId(usize);

struct DbInner {
    /// Committed table contents.
    tables: TableMap,
    /// Table registration order; `TableId` indexes into this.
    names: Vec<String>,
}

impl DbInner {
    fn name(&self, table: TableId) -> &str {
        &self.names[table.0]
    }
}

/// An open metadata database.
pub struct Database {
    inner: Mutex<DbInner>,
    /// Serialises write transactions; held for the transaction's lifetime.
    writer: Mutex<()>,
    dir: PathBuf,
    read_only: bool,
}

impl Database {
    /// Open (or create) the database in `dir`.
    ///
    /// A directory that denies writes yields a read-only handle rather than
    /// an error; transactions against it fail with [`StrataError::ReadOnly`].
    pub fn open(dir: &Path) -> Result<Database> {
        let mut read_only = false;
        match fs::create_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => read_only = true,
            Err(e) => return Err(StrataError::io_at(e, dir)),
        }

        let snapshot = dir.join(SNAPSHOT_FILE);
        let tables: TableMap = if snapshot.exists() {
            let bytes =
                fs::read(&snapshot).map_err(|e| StrataError::io_at(e, &snapshot))?;
            serde_json::from_slice(&bytes).map_err(|e| StrataError::DatabaseCorrupt {
                path: snapshot.clone(),
                detail: e.to_string(),
            })?
        } else {
            TableMap::new()
        };

        if !read_only && tempfile::tempfile_in(dir).is_err() {
            read_only = true;
        }
        if read_only {
            debug!(dir = %dir.display(), "metadata database opened read-only");
        }

        Ok(Database {
            inner: Mutex::new(DbInner {
                tables,
                names: Vec::new(),
            }),
            writer: Mutex::new(()),
            dir: dir.to_owned(),
            read_only,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Close the database. All committed state is already durable; this
    /// exists so teardown reads explicitly at call sites.
    pub fn close(self) {}

    /// Register a table name and return its handle. Idempotent.
    pub fn open_table(&self, name: &str) -> TableId {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.names.iter().position(|n| n == name) {
            return TableId(pos);
        }
        inner.names.push(name.to_owned());
        TableId(inner.names.len() - 1)
    }

    /// Drop a whole table and persist the removal. Used by schema upgrades.
    pub fn delete_table(&self, name: &str) -> Result<()> {
        if self.read_only {
            return Err(StrataError::ReadOnly);
        }
        let _writer = self.writer.lock();
        let mut inner = self.inner.lock();
        if inner.tables.remove(name).is_some() {
            let tables = inner.tables.clone();
            self.persist(&tables)?;
        }
        Ok(())
    }

    /// Begin a write transaction. Blocks while another writer is active.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        if self.read_only {
            return Err(StrataError::ReadOnly);
        }
        Ok(Transaction {
            db: self,
            _writer: self.writer.lock(),
            writes: HashMap::new(),
        })
    }

    /// Committed read: first value under `key`, if any.
    pub fn get(&self, table: TableId, key: &str) -> Option<String> {
        self.get_list(table, key).into_iter().next()
    }

    /// Committed read: full value list under `key` (empty if absent).
    pub fn get_list(&self, table: TableId, key: &str) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .tables
            .get(inner.name(table))
            .and_then(|t| t.get(key))
            .cloned()
            .unwrap_or_default()
    }

    /// Committed read: does `key` exist in `table`?
    pub fn contains(&self, table: TableId, key: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .tables
            .get(inner.name(table))
            .map(|t| t.contains_key(key))
            .unwrap_or(false)
    }

    /// Committed read: all keys of `table`, in order.
    pub fn enumerate(&self, table: TableId) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .tables
            .get(inner.name(table))
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn persist(&self, tables: &TableMap) -> Result<()> {
        let bytes = serde_json::to_vec(tables).map_err(|e| StrataError::DatabaseCorrupt {
            path: self.dir.join(SNAPSHOT_FILE),
            detail: e.to_string(),
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| StrataError::io_at(e, &self.dir))?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.dir.join(SNAPSHOT_FILE))
            .map_err(|e| StrataError::Io(e.error))?;
        if let Ok(d) = File::open(&self.dir) {
            let _ = d.sync_all();
        }
        Ok(())
    }
}

/// A write transaction over a [`Database`].
///
/// Reads observe the transaction's own uncommitted writes layered over the
/// committed snapshot. Dropping without [`Transaction::commit`] discards all
/// buffered writes.
pub struct Transaction<'db> {
    db: &'db Database,
    _writer: MutexGuard<'db, ()>,
    /// Buffered writes: `None` marks a deletion.
    writes: HashMap<(TableId, String), Option<Vec<String>>>,
}

impl Transaction<'_> {
    /// First value under `key`, observing buffered writes.
    pub fn get(&self, table: TableId, key: &str) -> Option<String> {
        self.get_list(table, key).into_iter().next()
    }

    /// Full value list under `key`, observing buffered writes.
    pub fn get_list(&self, table: TableId, key: &str) -> Vec<String> {
        match self.writes.get(&(table, key.to_owned())) {
            Some(Some(values)) => values.clone(),
            Some(None) => Vec::new(),
            None => self.db.get_list(table, key),
        }
    }

    pub fn contains(&self, table: TableId, key: &str) -> bool {
        match self.writes.get(&(table, key.to_owned())) {
            Some(entry) => entry.is_some(),
            None => self.db.contains(table, key),
        }
    }

    /// All keys of `table` in order, observing buffered writes.
    pub fn enumerate(&self, table: TableId) -> Vec<String> {
        let mut keys: BTreeSet<String> = self.db.enumerate(table).into_iter().collect();
        for ((t, key), entry) in &self.writes {
            if *t != table {
                continue;
            }
            if entry.is_some() {
                keys.insert(key.clone());
            } else {
                keys.remove(key);
            }
        }
        keys.into_iter().collect()
    }

    /// Buffer a single-value write.
    pub fn set(&mut self, table: TableId, key: &str, value: &str) {
        self.set_list(table, key, vec![value.to_owned()]);
    }

    /// Buffer an ordered multi-value write.
    pub fn set_list(&mut self, table: TableId, key: &str, values: Vec<String>) {
        self.writes.insert((table, key.to_owned()), Some(values));
    }

    /// Buffer a deletion.
    pub fn delete(&mut self, table: TableId, key: &str) {
        self.writes.insert((table, key.to_owned()), None);
    }

    /// Apply all buffered writes in one atomic, durable step.
    pub fn commit(self) -> Result<()> {
        let mut inner = self.db.inner.lock();
        let mut tables = inner.tables.clone();
        for ((table, key), entry) in &self.writes {
            let name = inner.name(*table).to_owned();
            match entry {
                Some(values) => {
                    tables.entry(name).or_default().insert(key.clone(), values.clone());
                }
                None => {
                    if let Some(t) = tables.get_mut(&name) {
                        t.remove(key);
                    }
                }
            }
        }
        self.db.persist(&tables)?;
        inner.tables = tables;
        Ok(())
    }

    /// Discard all buffered writes. Equivalent to dropping the transaction.
    pub fn abort(self) {}
}

/// Build the composite key for a revisioned table row.
pub fn merge_key(path: &Path, n: u64) -> String {
    format!("{}{}{}", path.display(), KEY_SEPARATOR, n)
}

/// Split a composite key back into its path and number.
///
/// Splits on the last separator occurrence, so paths containing the
/// separator text still round-trip.
pub fn split_key(key: &str) -> Option<(PathBuf, u64)> {
    let pos = key.rfind(KEY_SEPARATOR)?;
    let n: u64 = key[pos + KEY_SEPARATOR.len()..].parse().ok()?;
    Some((PathBuf::from(&key[..pos]), n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn writes_invisible_until_commit() {
        let (_dir, db) = open_temp();
        let t = db.open_table("valid");

        let mut txn = db.transaction().unwrap();
        txn.set(t, "/s/store/a", "sha256:00");
        assert_eq!(txn.get(t, "/s/store/a").as_deref(), Some("sha256:00"));
        assert_eq!(db.get(t, "/s/store/a"), None);

        txn.commit().unwrap();
        assert_eq!(db.get(t, "/s/store/a").as_deref(), Some("sha256:00"));
    }

    #[test]
    fn abort_discards_writes() {
        let (_dir, db) = open_temp();
        let t = db.open_table("valid");
        let mut txn = db.transaction().unwrap();
        txn.set(t, "k", "v");
        txn.abort();
        assert_eq!(db.get(t, "k"), None);
    }

    #[test]
    fn delete_inside_transaction_masks_committed_row() {
        let (_dir, db) = open_temp();
        let t = db.open_table("valid");
        let mut txn = db.transaction().unwrap();
        txn.set(t, "k", "v");
        txn.commit().unwrap();

        let mut txn = db.transaction().unwrap();
        txn.delete(t, "k");
        assert!(!txn.contains(t, "k"));
        assert!(txn.enumerate(t).is_empty());
        txn.commit().unwrap();
        assert!(!db.contains(t, "k"));
    }

    #[test]
    fn enumerate_is_ordered_and_merged() {
        let (_dir, db) = open_temp();
        let t = db.open_table("refs");
        let mut txn = db.transaction().unwrap();
        txn.set(t, "b", "1");
        txn.set(t, "a", "2");
        txn.commit().unwrap();

        let mut txn = db.transaction().unwrap();
        txn.set(t, "c", "3");
        txn.delete(t, "a");
        assert_eq!(txn.enumerate(t), vec!["b".to_owned(), "c".to_owned()]);
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            let t = db.open_table("valid");
            let mut txn = db.transaction().unwrap();
            txn.set_list(t, "k", vec!["a".into(), "b".into()]);
            txn.commit().unwrap();
        }
        let db = Database::open(dir.path()).unwrap();
        let t = db.open_table("valid");
        assert_eq!(db.get_list(t, "k"), vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), b"not json").unwrap();
        assert!(matches!(
            Database::open(dir.path()),
            Err(StrataError::DatabaseCorrupt { .. })
        ));
    }

    #[test]
    fn composite_keys_roundtrip() {
        let key = merge_key(Path::new("/s/state/abc-app-default"), 7);
        let (path, n) = split_key(&key).unwrap();
        assert_eq!(path, Path::new("/s/state/abc-app-default"));
        assert_eq!(n, 7);

        // A path containing the separator text still splits on the last one.
        let tricky = merge_key(Path::new("/s/state/x-KEY-y"), 3);
        let (path, n) = split_key(&tricky).unwrap();
        assert_eq!(path, Path::new("/s/state/x-KEY-y"));
        assert_eq!(n, 3);

        assert!(split_key("no separator here").is_none());
    }
}
