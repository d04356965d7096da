//! LSM engine: memtables in front of the level manager
//!
//! ## Write path
//! 1. Writers serialize on `write_lock` and take the next sequence number
//! 2. A full active memtable is sealed into the immutable queue and replaced
//! 3. The entry goes to the active memtable (WAL, then skip list)
//! 4. Queued immutables are flushed to L0 outside the write lock
//!
//! ## Read path
//! Active memtable → immutables (newest first) → levels. The first hit wins,
//! tombstones included; callers decide what a dead entry means.
//!
//! ## Background
//! One periodic task drains immutables whose flush failed and compacts
//! levels until every score is below 1. It holds a `Weak` to the tree.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::compaction::CompactionStats;
use super::levels::{DiscardHook, LevelManager, LevelStat};
use super::memtable::MemTable;
use super::merging_iterator::{EntryIterator, MergingIterator};
use super::wal::parse_wal_id;
use crate::config::Options;
use crate::storage::codec::{Entry, ValueData, ValuePtr};
use crate::storage::vlog::ValueIndex;
use crate::task::{BackgroundTask, TaskControl};
use crate::{Result, StorageError};

struct MemTables {
    active: Arc<MemTable>,
    /// Oldest at the front
    immutables: VecDeque<Arc<MemTable>>,
}

/// Memtable summary for stats output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemTableStats {
    pub active_entries: usize,
    pub active_bytes: usize,
    pub immutables: usize,
}

pub struct LsmTree {
    opts: Arc<Options>,
    wal_dir: PathBuf,
    write_lock: Mutex<()>,
    memtables: RwLock<MemTables>,
    levels: Arc<LevelManager>,
    next_seq: AtomicU64,
    next_wal_id: AtomicU64,
    /// One flusher at a time; flushes must land in queue order
    flush_lock: Mutex<()>,
    closed: AtomicBool,
    compactor: Mutex<Option<BackgroundTask>>,
}

impl LsmTree {
    /// Open the tree: manifest and tables, then WAL replay, then the
    /// background compaction task
    pub fn open(opts: Arc<Options>, discard_hook: Option<DiscardHook>) -> Result<Arc<Self>> {
        opts.validate()?;
        let levels = Arc::new(LevelManager::open(Arc::clone(&opts), discard_hook)?);
        let disk_seq = levels.max_seq();

        let wal_dir = opts.wal_dir();
        std::fs::create_dir_all(&wal_dir)?;
        let mut wal_paths = Vec::new();
        for dirent in std::fs::read_dir(&wal_dir)? {
            let path = dirent?.path();
            if let Some(id) = parse_wal_id(&path) {
                wal_paths.push((id, path));
            }
        }
        wal_paths.sort_by_key(|(id, _)| *id);

        let mut next_wal_id = 1;
        let mut max_seq = disk_seq;
        let mut recovered = Vec::new();
        for (id, path) in wal_paths {
            next_wal_id = next_wal_id.max(id + 1);
            let memtable = MemTable::recover(&path, opts.sync_writes)?;
            if !memtable.is_empty() && memtable.max_seq() <= disk_seq {
                // Flushed before the crash, only the WAL delete was lost
                debug!(wal = id, "Dropping already flushed WAL");
                memtable.discard()?;
                continue;
            }
            max_seq = max_seq.max(memtable.max_seq());
            info!(wal = id, entries = memtable.len(), "Replayed WAL");
            recovered.push(Arc::new(memtable));
        }

        let active = match recovered.pop() {
            Some(memtable) => memtable,
            None => {
                let id = next_wal_id;
                next_wal_id += 1;
                Arc::new(MemTable::create(&wal_dir, id, opts.sync_writes)?)
            }
        };
        for memtable in &recovered {
            memtable.seal()?;
        }

        let tree = Arc::new(Self {
            wal_dir,
            write_lock: Mutex::new(()),
            memtables: RwLock::new(MemTables {
                active,
                immutables: recovered.into(),
            }),
            levels,
            next_seq: AtomicU64::new(max_seq + 1),
            next_wal_id: AtomicU64::new(next_wal_id),
            flush_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            compactor: Mutex::new(None),
            opts,
        });

        if let Err(e) = tree.flush_pending() {
            warn!(error = %e, "Flushing replayed WALs failed, will retry");
        }

        let task = BackgroundTask::spawn_periodic(
            "compaction",
            tree.opts.compaction_interval(),
            compaction_job(Arc::downgrade(&tree)),
        )?;
        *tree.compactor.lock() = Some(task);

        info!(dir = %tree.opts.dir.display(), next_seq = max_seq + 1, "LSM tree opened");
        Ok(tree)
    }

    /// Write one entry. Returns the sequence number it was given.
    pub fn set(&self, entry: Entry) -> Result<u64> {
        let seq = {
            let _writer = self.write_lock.lock();
            self.write_locked(entry)?
        };
        self.try_flush_pending();
        Ok(seq)
    }

    fn write_locked(&self, mut entry: Entry) -> Result<u64> {
        self.check_open()?;
        entry.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.make_room()?;
        let active = Arc::clone(&self.memtables.read().active);
        active.set(&entry)?;
        Ok(entry.seq)
    }

    /// Seal the active memtable once it is full. Caller holds `write_lock`.
    fn make_room(&self) -> Result<()> {
        let full = self.memtables.read().active.size() >= self.opts.memtable_size;
        if full {
            self.rotate()?;
        }
        Ok(())
    }

    /// Swap in a fresh active memtable. Caller holds `write_lock`.
    fn rotate(&self) -> Result<()> {
        let id = self.next_wal_id.fetch_add(1, Ordering::SeqCst);
        let fresh = Arc::new(MemTable::create(&self.wal_dir, id, self.opts.sync_writes)?);
        let mut memtables = self.memtables.write();
        let old = std::mem::replace(&mut memtables.active, fresh);
        old.seal()?;
        debug!(memtable = old.id(), entries = old.len(), bytes = old.size(), "Sealed memtable");
        memtables.immutables.push_back(old);
        if memtables.immutables.len() > 4 {
            warn!(queued = memtables.immutables.len(), "Immutable memtables are piling up");
        }
        Ok(())
    }

    /// Newest entry for `key` across all layers, tombstones included
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.check_open()?;
        {
            let memtables = self.memtables.read();
            if let Some(entry) = memtables.active.get(key) {
                return Ok(Some(entry));
            }
            for memtable in memtables.immutables.iter().rev() {
                if let Some(entry) = memtable.get(key) {
                    return Ok(Some(entry));
                }
            }
        }
        self.levels.get(key)
    }

    /// Point `key` at `new` if its current entry still points at `old`
    pub fn rewrite_pointer(&self, key: &[u8], old: ValuePtr, new: ValuePtr) -> Result<bool> {
        let swapped = {
            let _writer = self.write_lock.lock();
            match self.get(key)? {
                Some(mut current)
                    if !current.is_dead() && current.value.as_pointer() == Some(old) =>
                {
                    current.value = ValueData::Pointer(new);
                    self.write_locked(current)?;
                    true
                }
                _ => false,
            }
        };
        if swapped {
            self.try_flush_pending();
        }
        Ok(swapped)
    }

    /// Newest version of every key starting with `prefix`, ascending,
    /// tombstones included
    pub fn scan(&self, prefix: &[u8]) -> Result<EntryIterator> {
        self.check_open()?;
        let mut sources: Vec<EntryIterator> = Vec::new();
        {
            let memtables = self.memtables.read();
            sources.push(Box::new(memtables.active.seek(prefix).map(Ok)));
            for memtable in memtables.immutables.iter().rev() {
                sources.push(Box::new(memtable.seek(prefix).map(Ok)));
            }
        }
        sources.extend(self.levels.iterators(prefix)?);

        let prefix = prefix.to_vec();
        Ok(Box::new(MergingIterator::new(sources).take_while(
            move |item| match item {
                Ok(entry) => entry.key.starts_with(&prefix),
                Err(_) => true,
            },
        )))
    }

    /// Seal the active memtable and flush everything queued
    pub fn flush(&self) -> Result<()> {
        {
            let _writer = self.write_lock.lock();
            self.check_open()?;
            let has_data = !self.memtables.read().active.is_empty();
            if has_data {
                self.rotate()?;
            }
        }
        self.flush_pending()?;
        Ok(())
    }

    /// Flush queued immutables oldest first. Stops at the first failure,
    /// leaving that memtable queued and readable.
    fn flush_pending(&self) -> Result<usize> {
        let _flusher = self.flush_lock.lock();
        self.flush_queue()
    }

    /// Foreground variant: skip if another thread is already flushing
    fn try_flush_pending(&self) {
        let Some(_flusher) = self.flush_lock.try_lock() else {
            return;
        };
        if let Err(e) = self.flush_queue() {
            error!(error = %e, "Memtable flush failed, will retry");
        }
    }

    fn flush_queue(&self) -> Result<usize> {
        let mut flushed = 0;
        loop {
            let Some(oldest) = self.memtables.read().immutables.front().cloned() else {
                return Ok(flushed);
            };
            self.levels.flush(&oldest)?;
            {
                let mut memtables = self.memtables.write();
                if memtables
                    .immutables
                    .front()
                    .is_some_and(|m| Arc::ptr_eq(m, &oldest))
                {
                    memtables.immutables.pop_front();
                }
            }
            if let Err(e) = oldest.discard() {
                // Replay skips it: its entries are older than the tables' max seq
                warn!(memtable = oldest.id(), error = %e, "Failed to delete flushed WAL");
            }
            flushed += 1;
        }
    }

    /// Compact until no level is over budget. Returns the number of rounds.
    pub fn compact(&self) -> Result<usize> {
        self.check_open()?;
        self.levels.compact_until_settled()
    }

    pub fn level_stats(&self) -> Vec<LevelStat> {
        self.levels.level_stats()
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        self.levels.compaction_stats()
    }

    pub fn memtable_stats(&self) -> MemTableStats {
        let memtables = self.memtables.read();
        MemTableStats {
            active_entries: memtables.active.len(),
            active_bytes: memtables.active.size(),
            immutables: memtables.immutables.len(),
        }
    }

    /// Next sequence number to be handed out
    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Stop compaction, sync every WAL and close the levels. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let task = self.compactor.lock().take();
        if let Some(mut task) = task {
            task.stop();
        }

        let _writer = self.write_lock.lock();
        let _flusher = self.flush_lock.lock();
        let memtables = self.memtables.read();
        memtables.active.seal()?;
        for memtable in &memtables.immutables {
            memtable.seal()?;
        }
        self.levels.close();
        info!(dir = %self.opts.dir.display(), "LSM tree closed");
        Ok(())
    }
}

fn compaction_job(tree: Weak<LsmTree>) -> impl FnMut() -> Result<TaskControl> + Send + 'static {
    move || {
        let Some(tree) = tree.upgrade() else {
            return Ok(TaskControl::Exit);
        };
        if tree.is_closed() {
            return Ok(TaskControl::Exit);
        }
        tree.flush_pending()?;
        let rounds = tree.levels.compact_until_settled()?;
        if rounds > 0 {
            debug!(rounds, "Background compaction pass");
        }
        Ok(TaskControl::Continue)
    }
}

impl ValueIndex for LsmTree {
    fn lookup(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.get(key)
    }

    fn relocate(&self, key: &[u8], old: ValuePtr, new: ValuePtr) -> Result<bool> {
        self.rewrite_pointer(key, old, new)
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Error closing LSM tree");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Arc<LsmTree> {
        LsmTree::open(Arc::new(Options::for_testing(dir.path())), None).unwrap()
    }

    fn value_of(entry: Option<Entry>) -> Option<Vec<u8>> {
        entry.and_then(|e| e.value.as_literal().map(|v| v.to_vec()))
    }

    #[test]
    fn test_set_get_overwrite() {
        let dir = TempDir::new().unwrap();
        let tree = open(&dir);

        let s1 = tree.set(Entry::new("k", "v1")).unwrap();
        let s2 = tree.set(Entry::new("k", "v2")).unwrap();
        assert!(s2 > s1);
        assert_eq!(value_of(tree.get(b"k").unwrap()), Some(b"v2".to_vec()));
        assert!(tree.get(b"missing").unwrap().is_none());

        tree.set(Entry::tombstone("k")).unwrap();
        assert!(tree.get(b"k").unwrap().unwrap().deleted);
    }

    #[test]
    fn test_rotation_and_flush() {
        let dir = TempDir::new().unwrap();
        let tree = open(&dir);

        for i in 0..2000u32 {
            tree.set(Entry::new(format!("key{:05}", i), vec![b'x'; 64])).unwrap();
        }
        let flushed = tree.compaction_stats().tables_flushed;
        assert!(flushed > 0, "16KB memtables must rotate and flush");

        for i in (0..2000u32).step_by(97) {
            let key = format!("key{:05}", i);
            assert!(tree.get(key.as_bytes()).unwrap().is_some(), "{} lost", key);
        }
    }

    #[test]
    fn test_reopen_replays_wal() {
        let dir = TempDir::new().unwrap();
        {
            let tree = open(&dir);
            tree.set(Entry::new("a", "1")).unwrap();
            tree.set(Entry::new("b", "2")).unwrap();
            tree.set(Entry::new("a", "3")).unwrap();
            tree.close().unwrap();
        }
        let tree = open(&dir);
        assert_eq!(value_of(tree.get(b"a").unwrap()), Some(b"3".to_vec()));
        assert_eq!(value_of(tree.get(b"b").unwrap()), Some(b"2".to_vec()));
        // Sequence numbers continue past the replayed ones
        assert!(tree.next_seq() > 3);
    }

    #[test]
    fn test_reopen_after_flush_and_compaction() {
        let dir = TempDir::new().unwrap();
        {
            let tree = open(&dir);
            for round in 0..3u32 {
                for i in 0..500u32 {
                    tree.set(Entry::new(format!("k{:04}", i), format!("r{}-{}", round, i))).unwrap();
                }
                tree.flush().unwrap();
            }
            tree.compact().unwrap();
            tree.close().unwrap();
        }
        let tree = open(&dir);
        for i in (0..500u32).step_by(37) {
            assert_eq!(
                value_of(tree.get(format!("k{:04}", i).as_bytes()).unwrap()),
                Some(format!("r2-{}", i).into_bytes())
            );
        }
        let wal_count = std::fs::read_dir(dir.path().join("wal")).unwrap().count();
        assert_eq!(wal_count, 1, "flushed WALs are deleted");
    }

    #[test]
    fn test_scan_merges_layers() {
        let dir = TempDir::new().unwrap();
        let tree = open(&dir);

        tree.set(Entry::new("user:1", "old")).unwrap();
        tree.set(Entry::new("user:2", "two")).unwrap();
        tree.flush().unwrap();
        tree.set(Entry::new("user:1", "new")).unwrap();
        tree.set(Entry::tombstone("user:2")).unwrap();
        tree.set(Entry::new("user:3", "three")).unwrap();
        tree.set(Entry::new("zzz", "other")).unwrap();

        let entries: Vec<Entry> = tree.scan(b"user:").unwrap().map(|r| r.unwrap()).collect();
        let keys: Vec<&[u8]> = entries.iter().map(|e| e.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"user:1"[..], &b"user:2"[..], &b"user:3"[..]]);
        assert_eq!(entries[0].value.as_literal(), Some(&b"new"[..]));
        assert!(entries[1].deleted);
    }

    #[test]
    fn test_rewrite_pointer_is_compare_and_set() {
        let dir = TempDir::new().unwrap();
        let tree = open(&dir);
        let old = ValuePtr { fid: 1, offset: 8, len: 100 };
        let new = ValuePtr { fid: 2, offset: 8, len: 100 };

        let mut entry = Entry::new("k", Vec::<u8>::new());
        entry.value = ValueData::Pointer(old);
        tree.set(entry).unwrap();

        assert!(tree.rewrite_pointer(b"k", old, new).unwrap());
        assert_eq!(tree.get(b"k").unwrap().unwrap().value.as_pointer(), Some(new));
        // Stale expectation fails
        assert!(!tree.rewrite_pointer(b"k", old, new).unwrap());

        tree.set(Entry::new("k", "literal")).unwrap();
        assert!(!tree.rewrite_pointer(b"k", new, old).unwrap());
        assert!(!tree.rewrite_pointer(b"absent", old, new).unwrap());
    }

    #[test]
    fn test_closed_tree_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let tree = open(&dir);
        tree.close().unwrap();
        tree.close().unwrap();
        assert!(matches!(tree.set(Entry::new("k", "v")), Err(StorageError::Closed)));
        assert!(matches!(tree.get(b"k"), Err(StorageError::Closed)));
    }

    #[test]
    fn test_concurrent_writers() {
        let dir = TempDir::new().unwrap();
        let tree = open(&dir);

        std::thread::scope(|s| {
            for t in 0..4u32 {
                let tree = &tree;
                s.spawn(move || {
                    for i in 0..300u32 {
                        tree.set(Entry::new(format!("t{}-{:04}", t, i), vec![t as u8; 32])).unwrap();
                    }
                });
            }
        });

        for t in 0..4u32 {
            for i in (0..300u32).step_by(23) {
                let key = format!("t{}-{:04}", t, i);
                assert!(tree.get(key.as_bytes()).unwrap().is_some());
            }
        }
    }
}
