//! MemTable: WAL-backed in-memory write buffer
//!
//! Every write goes to the WAL first and to the skip list second, under one
//! mutex, so the WAL replays in exactly the order the index saw.
//!
//! ## Lifecycle
//! active (accepts writes) → sealed (read-only, queued for flush) →
//! flushed into an L0 table → WAL discarded

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::skiplist::{SkipList, SkipListIter};
use super::wal::Wal;
use crate::storage::codec::Entry;
use crate::{Result, StorageError};

pub struct MemTable {
    id: u64,
    wal: Mutex<Wal>,
    list: Arc<SkipList>,
    sealed: AtomicBool,
    /// Highest sequence number written
    max_seq: AtomicU64,
}

impl MemTable {
    /// Create an empty memtable with a fresh WAL
    pub fn create(dir: &Path, id: u64, sync_writes: bool) -> Result<Self> {
        let wal = Wal::create(dir, id, sync_writes)?;
        Ok(Self::with_wal(wal))
    }

    /// Rebuild a memtable from an existing WAL
    pub fn recover(path: &Path, sync_writes: bool) -> Result<Self> {
        let (wal, entries) = Wal::open(path, sync_writes)?;
        let memtable = Self::with_wal(wal);
        for entry in entries {
            memtable.max_seq.fetch_max(entry.seq, Ordering::Relaxed);
            memtable.list.add(entry)?;
        }
        Ok(memtable)
    }

    fn with_wal(wal: Wal) -> Self {
        Self {
            id: wal.id(),
            wal: Mutex::new(wal),
            list: Arc::new(SkipList::new()),
            sealed: AtomicBool::new(false),
            max_seq: AtomicU64::new(0),
        }
    }

    /// Log then index one entry. A WAL failure leaves the index untouched.
    pub fn set(&self, entry: &Entry) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let mut wal = self.wal.lock();
        wal.write(entry)?;
        self.list.add(entry.clone())?;
        self.max_seq.fetch_max(entry.seq, Ordering::Relaxed);
        Ok(())
    }

    /// Newest version of `key`, tombstones included
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.list.search(key)
    }

    /// Stop accepting writes and make the WAL durable
    pub fn seal(&self) -> Result<()> {
        self.sealed.store(true, Ordering::Release);
        self.list.close();
        self.wal.lock().sync()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Delete the WAL once the contents are durable elsewhere
    pub fn discard(&self) -> Result<()> {
        let wal = self.wal.lock();
        match std::fs::remove_file(wal.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn iter(&self) -> SkipListIter {
        self.list.iter()
    }

    pub fn seek(&self, key: &[u8]) -> SkipListIter {
        self.list.seek(key)
    }

    pub fn iter_all_versions(&self) -> SkipListIter {
        self.list.iter_all_versions()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Approximate memory held, drives rotation
    pub fn size(&self) -> usize {
        self.list.mem_size()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::Relaxed)
    }
}
