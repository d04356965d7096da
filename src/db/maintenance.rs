//! Manual maintenance triggers and stats

use serde::Serialize;

use crate::stats::{StatEvent, StatsSnapshot};
use crate::storage::lsm::{CompactionStats, LevelStat, MemTableStats};
use crate::storage::vlog::GcStats;
use crate::Result;

use super::Db;

/// Store-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub ops: StatsSnapshot,
    pub memtables: MemTableStats,
    pub levels: Vec<LevelStat>,
    pub compaction: CompactionStats,
    pub vlog_files: usize,
    pub next_seq: u64,
}

impl Db {
    /// Seal the active memtable and write every memtable to L0
    pub fn flush(&self) -> Result<()> {
        self.check_open()?;
        self.lsm.flush()
    }

    /// Compact until no level is over budget. Returns the number of rounds run.
    pub fn compact(&self) -> Result<usize> {
        self.check_open()?;
        self.lsm.compact()
    }

    /// One value-log GC round with an explicit discard threshold. A ratio of 0
    /// rewrites the sealed file with the most garbage regardless.
    pub fn run_value_gc(&self, discard_ratio: f64) -> Result<Option<GcStats>> {
        self.check_open()?;
        let run = self.vlog.run_gc(self.lsm.as_ref(), discard_ratio)?;
        if let Some(stats) = &run {
            self.stats.record(StatEvent::GcRun {
                rewritten: stats.records_rewritten,
                reclaimed: stats.bytes_reclaimed,
            });
        }
        Ok(run)
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            ops: self.stats.snapshot(),
            memtables: self.lsm.memtable_stats(),
            levels: self.lsm.level_stats(),
            compaction: self.lsm.compaction_stats(),
            vlog_files: self.vlog.file_ids().len(),
            next_seq: self.lsm.next_seq(),
        }
    }
}
