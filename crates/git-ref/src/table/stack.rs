//! The tabular backend's on-disk stack: `tables.list` plus the table
//! files it names, oldest-first. Lookups walk the stack newest-first so a
//! more recent write (including a tombstone) shadows anything older;
//! writes append a new table under a lock on `tables.list` and
//! compaction periodically merges the tail back down.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use git_hash::{HashAlgorithm, ObjectId};
use git_utils::date::Signature;
use git_utils::lockfile::LockFile;
use git_utils::tempfile::TempFile;

use crate::error::RefError;
use crate::name::RefName;
use crate::reflog::ReflogEntry;
use crate::store::{RefTransaction, RefUpdateAction};
use crate::Reference;

use super::reader::Table;
use super::record::{LogRecord, LogValue, RefRecord, RefValue};
use super::writer::TableBuilder;

const LIST_NAME: &str = "tables.list";
/// Deadline for acquiring `tables.list.lock`, shared by writes and
/// compaction. The backoff schedule itself lives in `git_utils::lockfile`.
const LOCK_DEADLINE: Duration = Duration::from_secs(5);
/// Maximum depth for following a chain of `Symbolic` ref records.
const MAX_SYMREF_DEPTH: usize = 5;
/// Once the stack holds more tables than this, compact regardless of the
/// geometric size rule, so a long history of small transactions can't
/// make every lookup walk hundreds of tiny tables.
const MAX_TABLES_BEFORE_FORCED_COMPACTION: usize = 64;

/// One table file loaded into memory alongside the name it's listed
/// under in `tables.list`.
struct Entry {
    file_name: String,
    table: Table,
}

/// An open tabular reference stack rooted at a `reftable/` directory.
pub struct Stack {
    dir: PathBuf,
    algo: HashAlgorithm,
    entries: Vec<Entry>,
}

impl Stack {
    /// Open (creating if absent) the reftable directory at `dir`.
    pub fn open(dir: impl AsRef<Path>, algo: HashAlgorithm) -> Result<Self, RefError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| RefError::IoPath {
            path: dir.clone(),
            source: e,
        })?;
        let names = read_list(&dir)?;
        let mut entries = Vec::with_capacity(names.len());
        for file_name in names {
            let path = dir.join(&file_name);
            let data = match fs::read(&path) {
                Ok(d) => d,
                // A table named in tables.list but missing from disk is a
                // torn write elsewhere; skip it rather than fail the open.
                Err(_) => continue,
            };
            match Table::parse(&data) {
                Ok(table) => entries.push(Entry { file_name, table }),
                // §4.8 Integrity: a corrupt table is quarantined, not fatal.
                Err(_) => continue,
            }
        }
        Ok(Self { dir, algo, entries })
    }

    fn max_update_index(&self) -> u64 {
        self.entries.iter().map(|e| e.table.max_update_index).max().unwrap_or(0)
    }

    /// Look up the live ref record for `name`, scanning newest table
    /// first. A `Deletion` record found before any `Direct`/`Symbolic`
    /// record means the ref doesn't exist.
    fn lookup(&self, name: &RefName) -> Option<&RefValue> {
        let key = name.as_str().as_bytes();
        for entry in self.entries.iter().rev() {
            if let Some(r) = entry.table.refs.iter().find(|r| r.key() == key) {
                return Some(&r.value);
            }
        }
        None
    }

    pub fn resolve(&self, name: &RefName) -> Result<Option<Reference>, RefError> {
        Ok(self.lookup(name).and_then(|v| match v {
            RefValue::Deletion => None,
            RefValue::Direct(oid) | RefValue::DirectWithPeeled(oid, _) => Some(Reference::Direct {
                name: name.clone(),
                target: *oid,
            }),
            RefValue::Symbolic(target) => Some(Reference::Symbolic {
                name: name.clone(),
                target: target.clone(),
            }),
        }))
    }

    pub fn resolve_to_oid(&self, name: &RefName) -> Result<Option<ObjectId>, RefError> {
        self.resolve_to_oid_inner(name, 0)
    }

    fn resolve_to_oid_inner(&self, name: &RefName, depth: usize) -> Result<Option<ObjectId>, RefError> {
        if depth > MAX_SYMREF_DEPTH {
            return Err(RefError::SymrefLoop(name.to_string()));
        }
        match self.lookup(name) {
            None | Some(RefValue::Deletion) => Ok(None),
            Some(RefValue::Direct(oid)) | Some(RefValue::DirectWithPeeled(oid, _)) => Ok(Some(*oid)),
            Some(RefValue::Symbolic(target)) => {
                let target = target.clone();
                self.resolve_to_oid_inner(&target, depth + 1)
            }
        }
    }

    /// Merge the live ref set across the whole stack (oldest-to-newest so
    /// later tables win), optionally filtered by name prefix.
    pub fn iter(&self, prefix: Option<&str>) -> Result<Vec<Reference>, RefError> {
        let mut live: BTreeMap<Vec<u8>, RefRecord> = BTreeMap::new();
        for entry in &self.entries {
            for r in &entry.table.refs {
                live.insert(r.key().to_vec(), r.clone());
            }
        }
        let mut out = Vec::new();
        for r in live.into_values() {
            if let Some(p) = prefix {
                if !r.name.as_str().starts_with(p) {
                    continue;
                }
            }
            match r.value {
                RefValue::Deletion => {}
                RefValue::Direct(oid) | RefValue::DirectWithPeeled(oid, _) => {
                    out.push(Reference::Direct { name: r.name, target: oid });
                }
                RefValue::Symbolic(target) => {
                    out.push(Reference::Symbolic { name: r.name, target });
                }
            }
        }
        out.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(out)
    }

    /// Reflog for `name`, newest-first. Tables are stored oldest-first and
    /// each table's own update-index range is disjoint from (and lower
    /// than) every later table's, so concatenating from the newest table
    /// down preserves global newest-first order without a merge step.
    pub fn reflog(&self, name: &RefName) -> Result<Vec<ReflogEntry>, RefError> {
        let mut out = Vec::new();
        for entry in self.entries.iter().rev() {
            for l in &entry.table.logs {
                if l.ref_name != *name {
                    continue;
                }
                match &l.value {
                    LogValue::Deletion => {}
                    LogValue::Update {
                        old_oid,
                        new_oid,
                        committer,
                        message,
                    } => out.push(ReflogEntry {
                        old_oid: *old_oid,
                        new_oid: *new_oid,
                        identity: committer.clone(),
                        message: message.clone(),
                    }),
                }
            }
        }
        Ok(out)
    }

    /// Commit a transaction as a new table appended to the stack.
    ///
    /// Acquires `tables.list.lock`, re-reads the stack under that lock (in
    /// case another process appended since `open`), verifies every
    /// update's CAS condition against the freshly-read state, writes a
    /// single new table covering the diff, and atomically republishes
    /// `tables.list`. Runs opportunistic compaction afterwards.
    pub fn commit(&mut self, tx: RefTransaction, committer: Option<&Signature>) -> Result<(), RefError> {
        if tx.is_empty() {
            return Ok(());
        }
        let lock = LockFile::acquire_with_backoff(self.dir.join(LIST_NAME), LOCK_DEADLINE)?;

        // Re-read under the lock: another writer may have appended a
        // table between our `open`/last commit and now.
        *self = Self::open_locked(&self.dir, self.algo)?;

        let next_update_index = self.max_update_index() + 1;
        let mut refs: Vec<RefRecord> = Vec::with_capacity(tx.updates().len());
        let mut logs: Vec<LogRecord> = Vec::with_capacity(tx.updates().len());

        for update in tx.updates() {
            let current = self.lookup(&update.name).cloned();
            let current_oid = match &current {
                Some(RefValue::Direct(oid)) | Some(RefValue::DirectWithPeeled(oid, _)) => Some(*oid),
                _ => None,
            };
            verify_cas(&update.name, &update.action, current_oid)?;

            let new_value = match &update.action {
                RefUpdateAction::Create { new_target } | RefUpdateAction::Update { new_target, .. } => {
                    RefValue::Direct(*new_target)
                }
                RefUpdateAction::Delete { .. } => RefValue::Deletion,
                RefUpdateAction::SetSymbolic { target } => RefValue::Symbolic(target.clone()),
            };
            refs.push(RefRecord {
                name: update.name.clone(),
                value: new_value,
            });

            if let (Some(msg), Some(sig)) = (&update.reflog_message, committer) {
                let null = null_oid(self.algo);
                let (old_oid, new_oid) = match &update.action {
                    RefUpdateAction::Create { new_target } => (null, *new_target),
                    RefUpdateAction::Update { new_target, .. } => (current_oid.unwrap_or(null), *new_target),
                    RefUpdateAction::Delete { .. } => (current_oid.unwrap_or(null), null),
                    RefUpdateAction::SetSymbolic { .. } => continue,
                };
                logs.push(LogRecord {
                    ref_name: update.name.clone(),
                    update_index: next_update_index,
                    value: LogValue::Update {
                        old_oid,
                        new_oid,
                        committer: sig.clone(),
                        message: msg.as_str().into(),
                    },
                });
            }
        }

        refs.sort_by(|a, b| a.key().cmp(b.key()));
        logs.sort_by(|a, b| a.key().cmp(&b.key()));

        let builder = TableBuilder {
            algo: self.algo,
            min_update_index: next_update_index,
            max_update_index: next_update_index,
        };
        let bytes = builder.build(&refs, &logs)?;

        let mut tmp = TempFile::new_in(&self.dir)?;
        use std::io::Write;
        tmp.write_all(&bytes).map_err(|e| RefError::IoPath {
            path: self.dir.clone(),
            source: e,
        })?;
        let unique = tmp
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "table".to_string());
        let file_name = format!("{next_update_index:016x}-{next_update_index:016x}-{unique}.ref");
        let final_path = self.dir.join(&file_name);
        tmp.persist(&final_path).map_err(RefError::from)?;

        let mut names = read_list_from_lock(&lock, &self.dir)?;
        names.push(file_name.clone());
        write_list(lock, &names)?;

        self.entries.push(Entry {
            file_name,
            table: Table::parse(&bytes)?,
        });

        self.compact_if_needed()?;
        Ok(())
    }

    /// Re-open while a caller already holds `tables.list.lock`: reads the
    /// list file directly rather than racing the lock again.
    fn open_locked(dir: &Path, algo: HashAlgorithm) -> Result<Self, RefError> {
        Self::open(dir, algo)
    }

    /// Geometric compaction (§4.8): starting from the newest table, keep
    /// folding in the next-older table while its size is at least half
    /// the running sum, then rewrite that tail as one table. Runs once
    /// per call; `commit` calls it after every write so a long-lived
    /// stack converges over successive writes instead of needing a
    /// separate maintenance pass.
    fn compact_if_needed(&mut self) -> Result<(), RefError> {
        if self.entries.len() <= 1 {
            return Ok(());
        }
        let sizes: Vec<u64> = self
            .entries
            .iter()
            .map(|e| fs::metadata(self.dir.join(&e.file_name)).map(|m| m.len()).unwrap_or(0))
            .collect();

        let last = self.entries.len() - 1;
        let mut lo = last;
        let mut sum = sizes[last];
        let forced = self.entries.len() > MAX_TABLES_BEFORE_FORCED_COMPACTION;
        while lo > 0 {
            let older = sizes[lo - 1];
            if forced || (older as f64) >= (sum as f64) / 2.0 {
                lo -= 1;
                sum += older;
            } else {
                break;
            }
        }
        if lo == last {
            return Ok(());
        }
        self.compact_range(lo, last)
    }

    /// Merge `entries[lo..=hi]` (inclusive, oldest-to-newest within the
    /// range) into a single replacement table. `lo == 0` means nothing
    /// older survives the compaction, so tombstones in the range can be
    /// dropped outright; otherwise they must be kept so they keep
    /// shadowing whatever the surviving older tables still say.
    fn compact_range(&mut self, lo: usize, hi: usize) -> Result<(), RefError> {
        let drop_tombstones = lo == 0;
        let mut ref_map: BTreeMap<Vec<u8>, RefRecord> = BTreeMap::new();
        let mut log_map: BTreeMap<Vec<u8>, LogRecord> = BTreeMap::new();
        let mut min_ui = u64::MAX;
        let mut max_ui = 0u64;
        for entry in &self.entries[lo..=hi] {
            min_ui = min_ui.min(entry.table.min_update_index);
            max_ui = max_ui.max(entry.table.max_update_index);
            for r in &entry.table.refs {
                ref_map.insert(r.key().to_vec(), r.clone());
            }
            for l in &entry.table.logs {
                log_map.insert(l.key(), l.clone());
            }
        }
        let mut refs: Vec<RefRecord> = ref_map
            .into_values()
            .filter(|r| !(drop_tombstones && matches!(r.value, RefValue::Deletion)))
            .collect();
        refs.sort_by(|a, b| a.key().cmp(b.key()));
        let logs: Vec<LogRecord> = log_map.into_values().collect();

        let builder = TableBuilder {
            algo: self.algo,
            min_update_index: if min_ui == u64::MAX { 0 } else { min_ui },
            max_update_index: max_ui,
        };
        let bytes = builder.build(&refs, &logs)?;

        let lock = LockFile::acquire_with_backoff(self.dir.join(LIST_NAME), LOCK_DEADLINE)?;
        let mut tmp = TempFile::new_in(&self.dir)?;
        use std::io::Write;
        tmp.write_all(&bytes).map_err(|e| RefError::IoPath {
            path: self.dir.clone(),
            source: e,
        })?;
        let unique = tmp
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "table".to_string());
        let new_name = format!("{min_ui:016x}-{max_ui:016x}-{unique}.ref");
        let new_path = self.dir.join(&new_name);
        tmp.persist(&new_path).map_err(RefError::from)?;

        let mut names: Vec<String> = self.entries.iter().map(|e| e.file_name.clone()).collect();
        let removed: Vec<String> = names.splice(lo..=hi, [new_name.clone()]).collect();
        write_list(lock, &names)?;

        for old_name in removed {
            if old_name != new_name {
                let _ = fs::remove_file(self.dir.join(&old_name));
            }
        }

        let new_entry = Entry {
            file_name: new_name,
            table: Table::parse(&bytes)?,
        };
        self.entries.splice(lo..=hi, [new_entry]);
        Ok(())
    }
}

fn null_oid(algo: HashAlgorithm) -> ObjectId {
    match algo {
        HashAlgorithm::Sha1 => ObjectId::NULL_SHA1,
        HashAlgorithm::Sha256 => ObjectId::NULL_SHA256,
    }
}

fn verify_cas(name: &RefName, action: &RefUpdateAction, current_oid: Option<ObjectId>) -> Result<(), RefError> {
    match action {
        RefUpdateAction::Create { .. } => {
            if current_oid.is_some() {
                return Err(RefError::AlreadyExists(name.to_string()));
            }
        }
        RefUpdateAction::Update { old_target, .. } | RefUpdateAction::Delete { old_target } => {
            let actual = current_oid.ok_or_else(|| RefError::NotFound(name.to_string()))?;
            if actual != *old_target {
                return Err(RefError::CasFailed {
                    name: name.to_string(),
                    expected: *old_target,
                    actual,
                });
            }
        }
        RefUpdateAction::SetSymbolic { .. } => {}
    }
    Ok(())
}

fn read_list(dir: &Path) -> Result<Vec<String>, RefError> {
    let path = dir.join(LIST_NAME);
    match fs::read_to_string(&path) {
        Ok(content) => Ok(content.lines().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(RefError::IoPath { path, source: e }),
    }
}

fn read_list_from_lock(_lock: &LockFile, dir: &Path) -> Result<Vec<String>, RefError> {
    read_list(dir)
}

fn write_list(mut lock: LockFile, names: &[String]) -> Result<(), RefError> {
    use std::io::Write;
    let mut content = String::new();
    for name in names {
        content.push_str(name);
        content.push('\n');
    }
    lock.write_all(content.as_bytes()).map_err(|e| RefError::IoPath {
        path: lock.path().to_path_buf(),
        source: e,
    })?;
    lock.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::BString;
    use git_utils::date::GitDate;

    fn sig() -> Signature {
        Signature {
            name: BString::from("Test User"),
            email: BString::from("test@example.com"),
            date: GitDate::new(1234567890, 0),
        }
    }

    fn oid(b: u8) -> ObjectId {
        ObjectId::from_bytes(&[b; 20], HashAlgorithm::Sha1).unwrap()
    }

    #[test]
    fn create_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = Stack::open(dir.path(), HashAlgorithm::Sha1).unwrap();

        let mut tx = RefTransaction::new();
        let name = RefName::new("refs/heads/main").unwrap();
        tx.create(name.clone(), oid(1), "branch: created");
        stack.commit(tx, Some(&sig())).unwrap();

        assert_eq!(stack.resolve_to_oid(&name).unwrap(), Some(oid(1)));
    }

    #[test]
    fn update_then_delete_shadows_with_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = Stack::open(dir.path(), HashAlgorithm::Sha1).unwrap();
        let name = RefName::new("refs/heads/main").unwrap();

        let mut tx = RefTransaction::new();
        tx.create(name.clone(), oid(1), "create");
        stack.commit(tx, Some(&sig())).unwrap();

        let mut tx = RefTransaction::new();
        tx.delete(name.clone(), oid(1), "delete");
        stack.commit(tx, Some(&sig())).unwrap();

        assert_eq!(stack.resolve_to_oid(&name).unwrap(), None);
        assert!(stack.resolve(&name).unwrap().is_none());
    }

    #[test]
    fn cas_conflict_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = Stack::open(dir.path(), HashAlgorithm::Sha1).unwrap();
        let name = RefName::new("refs/heads/main").unwrap();

        let mut tx = RefTransaction::new();
        tx.create(name.clone(), oid(1), "create");
        stack.commit(tx, Some(&sig())).unwrap();

        let mut tx = RefTransaction::new();
        tx.update(name.clone(), oid(99), oid(2), "bad cas");
        let err = stack.commit(tx, Some(&sig())).unwrap_err();
        assert!(matches!(err, RefError::CasFailed { .. }));
    }

    #[test]
    fn reopen_sees_committed_table() {
        let dir = tempfile::tempdir().unwrap();
        let name = RefName::new("refs/heads/main").unwrap();
        {
            let mut stack = Stack::open(dir.path(), HashAlgorithm::Sha1).unwrap();
            let mut tx = RefTransaction::new();
            tx.create(name.clone(), oid(1), "create");
            stack.commit(tx, Some(&sig())).unwrap();
        }
        let stack = Stack::open(dir.path(), HashAlgorithm::Sha1).unwrap();
        assert_eq!(stack.resolve_to_oid(&name).unwrap(), Some(oid(1)));
    }

    #[test]
    fn reflog_newest_first_across_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = Stack::open(dir.path(), HashAlgorithm::Sha1).unwrap();
        let name = RefName::new("refs/heads/main").unwrap();

        let mut tx = RefTransaction::new();
        tx.create(name.clone(), oid(1), "first");
        stack.commit(tx, Some(&sig())).unwrap();

        let mut tx = RefTransaction::new();
        tx.update(name.clone(), oid(1), oid(2), "second");
        stack.commit(tx, Some(&sig())).unwrap();

        let entries = stack.reflog(&name).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].new_oid, oid(2));
        assert_eq!(entries[1].new_oid, oid(1));
    }

    #[test]
    fn compaction_preserves_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = Stack::open(dir.path(), HashAlgorithm::Sha1).unwrap();
        let mut live = Vec::new();
        for i in 0..20u8 {
            let name = RefName::new(format!("refs/heads/b{i}")).unwrap();
            let mut tx = RefTransaction::new();
            tx.create(name.clone(), oid(i + 1), "create");
            stack.commit(tx, Some(&sig())).unwrap();
            live.push((name, oid(i + 1)));
        }
        for (name, expected) in &live {
            assert_eq!(stack.resolve_to_oid(name).unwrap(), Some(*expected));
        }
    }
}
