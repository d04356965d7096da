//! Level manager: the on-disk half of the LSM tree
//!
//! ## Architecture
//! - **L0**: tables flushed straight from memtables; ranges overlap, so every
//!   L0 table is probed, newest first.
//! - **L1..Ln**: disjoint tables sorted by smallest key; at most one table per
//!   level can hold a key.
//! - **State**: an immutable [`LevelState`] behind `RwLock<Arc<_>>`. Readers
//!   clone the `Arc` and never block writers for longer than the swap.
//! - **Manifest**: every layout change is made durable before the new state is
//!   published, so a reader never sees a table the manifest does not know.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::compaction::CompactionStats;
use super::memtable::MemTable;
use super::merging_iterator::EntryIterator;
use super::sstable::{parse_table_id, table_file_name, SSTable, SSTableBuilder};
use crate::config::Options;
use crate::storage::codec::{Entry, ValuePtr};
use crate::storage::manifest::{Manifest, VersionEdit};
use crate::{Result, StorageError};

/// Receives value-log pointers that no live index entry references any more
pub type DiscardHook = Arc<dyn Fn(&[ValuePtr]) + Send + Sync>;

/// Immutable snapshot of the level layout
#[derive(Clone, Default)]
pub struct LevelState {
    pub levels: Vec<Vec<Arc<SSTable>>>,
}

impl LevelState {
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.levels
            .get(level)
            .map(|tables| tables.iter().map(|t| t.meta().size).sum())
            .unwrap_or(0)
    }

    /// The only table of a sorted level (L1+) whose range can hold `key`
    pub fn find_in_level(&self, level: usize, key: &[u8]) -> Option<&Arc<SSTable>> {
        let tables = self.levels.get(level)?;
        let idx = tables.partition_point(|t| t.meta().largest.as_slice() < key);
        tables
            .get(idx)
            .filter(|t| t.meta().smallest.as_slice() <= key)
    }

    /// Does any level below `level` have a table whose range covers `key`?
    pub fn key_may_exist_below(&self, level: usize, key: &[u8]) -> bool {
        (level + 1..self.levels.len()).any(|deeper| self.find_in_level(deeper, key).is_some())
    }
}

/// Per-level summary for stats output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelStat {
    pub level: usize,
    pub tables: usize,
    pub bytes: u64,
}

pub struct LevelManager {
    pub(super) opts: Arc<Options>,
    sst_dir: PathBuf,
    manifest: Mutex<Manifest>,
    state: RwLock<Arc<LevelState>>,
    /// One compaction at a time
    pub(super) compaction_lock: Mutex<()>,
    pub(super) stats: Mutex<CompactionStats>,
    discard_hook: Option<DiscardHook>,
    closed: AtomicBool,
}

impl LevelManager {
    /// Replay the manifest, open every live table and remove orphans
    pub fn open(opts: Arc<Options>, discard_hook: Option<DiscardHook>) -> Result<Self> {
        let sst_dir = opts.sst_dir();
        std::fs::create_dir_all(&sst_dir)?;
        let manifest = Manifest::open(&sst_dir, opts.num_levels, opts.manifest_rewrite_threshold)?;

        let version = manifest.version();
        let mut levels = Vec::with_capacity(version.levels.len());
        for tables in &version.levels {
            let mut opened = Vec::with_capacity(tables.len());
            for meta in tables {
                let path = sst_dir.join(table_file_name(meta.id));
                let table = SSTable::open(&path, meta.id).map_err(|e| {
                    StorageError::Corruption(format!("table {} listed in manifest: {}", meta.id, e))
                })?;
                opened.push(Arc::new(table));
            }
            levels.push(opened);
        }

        let live: AHashSet<u64> = version.levels.iter().flatten().map(|t| t.id).collect();
        remove_orphans(&sst_dir, &live)?;

        Ok(Self {
            opts,
            sst_dir,
            manifest: Mutex::new(manifest),
            state: RwLock::new(Arc::new(LevelState { levels })),
            compaction_lock: Mutex::new(()),
            stats: Mutex::new(CompactionStats::default()),
            discard_hook,
            closed: AtomicBool::new(false),
        })
    }

    pub fn snapshot(&self) -> Arc<LevelState> {
        Arc::clone(&self.state.read())
    }

    /// Newest entry for `key` on disk (tombstones included)
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.check_open()?;
        let state = self.snapshot();

        if let Some(l0) = state.levels.first() {
            for table in l0.iter().rev() {
                if let Some(entry) = table.get(key)? {
                    return Ok(Some(entry));
                }
            }
        }
        for level in 1..state.levels.len() {
            if let Some(table) = state.find_in_level(level, key) {
                if let Some(entry) = table.get(key)? {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }

    /// Write a sealed memtable into a new L0 table
    pub fn flush(&self, memtable: &MemTable) -> Result<()> {
        self.check_open()?;
        if memtable.is_empty() {
            return Ok(());
        }

        let id = self.allocate_table_id();
        let path = self.table_path(id);
        let mut builder = SSTableBuilder::new(&path, id, &self.opts)?;
        let mut discarded = Vec::new();
        let mut last_key: Option<Vec<u8>> = None;

        for entry in memtable.iter_all_versions() {
            if last_key.as_deref() == Some(entry.key.as_slice()) {
                // Shadowed by a newer version in the same memtable
                discarded.extend(entry.value.as_pointer());
                continue;
            }
            if let Err(e) = builder.add(&entry) {
                builder.abandon();
                return Err(e);
            }
            last_key = Some(entry.key);
        }

        let meta = builder.finish()?;
        let table = Arc::new(SSTable::open(&path, id)?);

        let mut edit = VersionEdit::new();
        edit.add_table(0, meta.clone());
        self.install(&edit, vec![(0, table)])?;
        self.report_discards(&discarded);

        {
            let mut stats = self.stats.lock();
            stats.tables_flushed += 1;
            stats.bytes_flushed += meta.size;
        }
        info!(
            memtable = memtable.id(),
            table = id,
            entries = meta.num_entries,
            bytes = meta.size,
            "Flushed memtable to L0"
        );
        Ok(())
    }

    /// Make `edit` durable, publish the new layout, then retire removed tables
    pub(super) fn install(
        &self,
        edit: &VersionEdit,
        added: Vec<(usize, Arc<SSTable>)>,
    ) -> Result<()> {
        let mut manifest = self.manifest.lock();
        manifest.apply(edit)?;

        let mut removed = Vec::new();
        {
            let mut state = self.state.write();
            let mut levels = state.levels.clone();
            for (level, id) in &edit.removed {
                if let Some(tables) = levels.get_mut(*level) {
                    if let Some(pos) = tables.iter().position(|t| t.id() == *id) {
                        removed.push(tables.remove(pos));
                    }
                }
            }
            for (level, table) in added {
                if levels.len() <= level {
                    levels.resize(level + 1, Vec::new());
                }
                let tables = &mut levels[level];
                if level == 0 {
                    tables.push(table);
                } else {
                    let pos = tables.partition_point(|t| t.meta().smallest < table.meta().smallest);
                    tables.insert(pos, table);
                }
            }
            *state = Arc::new(LevelState { levels });
        }
        drop(manifest);

        for table in removed {
            table.mark_obsolete();
        }
        Ok(())
    }

    /// Sorted sources, newest first, over every table that can hold a key
    /// starting with `prefix`. Each source starts at `prefix`.
    pub fn iterators(&self, prefix: &[u8]) -> Result<Vec<EntryIterator>> {
        self.check_open()?;
        let state = self.snapshot();
        let mut sources: Vec<EntryIterator> = Vec::new();
        for (level, tables) in state.levels.iter().enumerate() {
            let ordered: Box<dyn Iterator<Item = &Arc<SSTable>>> = if level == 0 {
                Box::new(tables.iter().rev())
            } else {
                Box::new(tables.iter())
            };
            for table in ordered {
                let meta = table.meta();
                if may_hold_prefix(&meta.smallest, &meta.largest, prefix) {
                    sources.push(Box::new(table.seek(prefix)));
                }
            }
        }
        Ok(sources)
    }

    pub(super) fn report_discards(&self, discarded: &[ValuePtr]) {
        if discarded.is_empty() {
            return;
        }
        if let Some(hook) = &self.discard_hook {
            hook(discarded);
        }
    }

    pub(super) fn allocate_table_id(&self) -> u64 {
        self.manifest.lock().allocate_table_id()
    }

    pub(super) fn table_path(&self, id: u64) -> PathBuf {
        self.sst_dir.join(table_file_name(id))
    }

    pub fn level_stats(&self) -> Vec<LevelStat> {
        let state = self.snapshot();
        state
            .levels
            .iter()
            .enumerate()
            .map(|(level, tables)| LevelStat {
                level,
                tables: tables.len(),
                bytes: state.level_bytes(level),
            })
            .collect()
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        self.stats.lock().clone()
    }

    /// Highest sequence number stored in any table
    pub fn max_seq(&self) -> u64 {
        self.manifest.lock().version().max_seq()
    }

    pub(super) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(dir = %self.sst_dir.display(), "Level manager closed");
        }
    }
}

fn remove_orphans(dir: &Path, live: &AHashSet<u64>) -> Result<()> {
    for dirent in std::fs::read_dir(dir)? {
        let path = dirent?.path();
        let Some(id) = parse_table_id(&path) else {
            continue;
        };
        if !live.contains(&id) {
            match std::fs::remove_file(&path) {
                Ok(()) => info!(table = id, "Removed orphan sstable"),
                Err(e) => warn!(table = id, error = %e, "Failed to remove orphan sstable"),
            }
        }
    }
    Ok(())
}

/// Keys with `prefix` form the range `[prefix, successor(prefix))`. A table
/// whose smallest key is past `prefix` without starting with it lies wholly
/// above that range.
fn may_hold_prefix(smallest: &[u8], largest: &[u8], prefix: &[u8]) -> bool {
    largest >= prefix && (smallest <= prefix || smallest.starts_with(prefix))
}
