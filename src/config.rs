//! Store configuration
//!
//! Every knob has a default, so a JSON config file only needs the fields it
//! changes:
//!
//! ```json
//! { "dir": "/var/lib/minikv", "memtable_size": 4194304, "sync_writes": false }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

/// Store options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Root directory; `wal/`, `sst/` and `vlog/` live underneath
    pub dir: PathBuf,

    /// Values longer than this go to the value log (default 1KB)
    pub value_threshold: usize,

    /// Memtable size that triggers rotation (default 1MB)
    pub memtable_size: usize,

    /// SSTable data block size (default 4KB)
    pub block_size: usize,

    /// Target size of compaction output tables (default 2MB)
    pub table_size: u64,

    /// Number of levels including L0 (default 7)
    pub num_levels: usize,

    /// L0 table count that triggers compaction (default 4)
    pub l0_compaction_trigger: usize,

    /// Size budget of L1 (default 10MB)
    pub base_level_size: u64,

    /// Each level below L1 may hold this many times the previous (default 10)
    pub level_multiplier: u64,

    /// Target bloom filter false-positive rate (default 1%)
    pub bloom_false_positive: f64,

    /// Snappy-compress SSTable blocks (default true)
    pub enable_compression: bool,

    /// fsync WAL and value-log appends before acknowledging (default true)
    pub sync_writes: bool,

    /// Value-log file rotation size (default 64MB)
    pub vlog_file_size: u64,

    /// Value-log GC period in milliseconds (default 10 minutes)
    pub vlog_gc_interval_ms: u64,

    /// Minimum discarded fraction before a value-log file is rewritten (default 0.5)
    pub vlog_gc_discard_ratio: f64,

    /// Compaction check period in milliseconds (default 1s)
    pub compaction_interval_ms: u64,

    /// Manifest size that triggers a snapshot rewrite (default 1MB)
    pub manifest_rewrite_threshold: u64,

    /// Cached open value-log file handles (default 16)
    pub vlog_handle_cache: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("minikv-data"),
            value_threshold: 1024,
            memtable_size: 1024 * 1024,
            block_size: 4 * 1024,
            table_size: 2 * 1024 * 1024,
            num_levels: 7,
            l0_compaction_trigger: 4,
            base_level_size: 10 * 1024 * 1024,
            level_multiplier: 10,
            bloom_false_positive: 0.01,
            enable_compression: true,
            sync_writes: true,
            vlog_file_size: 64 * 1024 * 1024,
            vlog_gc_interval_ms: 10 * 60 * 1000,
            vlog_gc_discard_ratio: 0.5,
            compaction_interval_ms: 1000,
            manifest_rewrite_threshold: 1024 * 1024,
            vlog_handle_cache: 16,
        }
    }
}

impl Options {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// Small sizes so tests rotate, flush and compact quickly. Background
    /// loops are effectively parked; tests drive them by hand.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            value_threshold: 64,
            memtable_size: 16 * 1024,
            block_size: 1024,
            table_size: 32 * 1024,
            l0_compaction_trigger: 2,
            base_level_size: 64 * 1024,
            vlog_file_size: 64 * 1024,
            vlog_gc_interval_ms: 3600 * 1000,
            compaction_interval_ms: 3600 * 1000,
            manifest_rewrite_threshold: 8 * 1024,
            ..Self::default()
        }
    }

    /// Load options from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let opts: Options = serde_json::from_str(&text)
            .map_err(|e| StorageError::Config(format!("{}: {}", path.display(), e)))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(StorageError::Config(msg.to_string()));
        if self.memtable_size == 0 {
            return fail("memtable_size must be positive");
        }
        if self.block_size == 0 || self.table_size == 0 {
            return fail("block_size and table_size must be positive");
        }
        if self.num_levels < 2 {
            return fail("num_levels must be at least 2");
        }
        if self.l0_compaction_trigger == 0 {
            return fail("l0_compaction_trigger must be positive");
        }
        if self.level_multiplier < 2 || self.base_level_size == 0 {
            return fail("level_multiplier must be >= 2 and base_level_size positive");
        }
        if !(self.bloom_false_positive > 0.0 && self.bloom_false_positive < 1.0) {
            return fail("bloom_false_positive must be in (0, 1)");
        }
        if !(0.0..=1.0).contains(&self.vlog_gc_discard_ratio) {
            return fail("vlog_gc_discard_ratio must be in [0, 1]");
        }
        if self.vlog_file_size == 0 || self.vlog_handle_cache == 0 {
            return fail("vlog_file_size and vlog_handle_cache must be positive");
        }
        Ok(())
    }

    /// Size budget of level `level` (L1 and below)
    pub fn level_max_bytes(&self, level: usize) -> u64 {
        let exp = level.saturating_sub(1) as u32;
        self.base_level_size
            .saturating_mul(self.level_multiplier.saturating_pow(exp))
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_millis(self.compaction_interval_ms)
    }

    pub fn vlog_gc_interval(&self) -> Duration {
        Duration::from_millis(self.vlog_gc_interval_ms)
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.dir.join("wal")
    }

    pub fn sst_dir(&self) -> PathBuf {
        self.dir.join("sst")
    }

    pub fn vlog_dir(&self) -> PathBuf {
        self.dir.join("vlog")
    }
}
