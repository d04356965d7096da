//! Leveled compaction
//!
//! ## Selection
//! Each level gets a score; the highest score of at least 1.0 compacts:
//! - L0: `table_count / l0_compaction_trigger`
//! - Ln: `level_bytes / level_max_bytes(n)`
//!
//! L0 compacts all of its tables (they overlap each other); Ln compacts its
//! largest table. Every table of level N+1 overlapping the inputs joins.
//!
//! ## Merge
//! - Newest sequence number per key survives.
//! - Tombstones and expired entries are dropped only when no deeper level has
//!   a table covering the key; otherwise they must keep shadowing it.
//! - Output is cut into tables of about `table_size` bytes.
//!
//! ## Commit
//! One manifest edit adds the outputs and removes the inputs. Inputs are
//! retired (file removed on last handle drop) only after that edit is durable.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::levels::{LevelManager, LevelState};
use super::merging_iterator::{EntryIterator, MergingIterator};
use super::sstable::{SSTable, SSTableBuilder};
use crate::storage::codec::{now_unix_secs, ValuePtr};
use crate::storage::manifest::VersionEdit;
use crate::Result;

/// Compaction statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompactionStats {
    /// Number of completed compactions
    pub num_compactions: u64,
    /// Bytes of input tables read by compaction
    pub bytes_read: u64,
    /// Bytes of output tables written by compaction
    pub bytes_written: u64,
    /// Tombstones and expired entries removed for good
    pub entries_dropped: u64,
    /// Memtables flushed to L0
    pub tables_flushed: u64,
    pub bytes_flushed: u64,
}

impl CompactionStats {
    pub fn write_amplification(&self) -> f64 {
        if self.bytes_flushed == 0 {
            return 0.0;
        }
        (self.bytes_flushed + self.bytes_written) as f64 / self.bytes_flushed as f64
    }
}

/// Tables chosen for one compaction
pub struct CompactionPlan {
    pub level: usize,
    pub inputs: Vec<Arc<SSTable>>,
    /// Overlapping tables of `level + 1`
    pub targets: Vec<Arc<SSTable>>,
}

impl CompactionPlan {
    pub fn output_level(&self) -> usize {
        self.level + 1
    }
}

/// Pick the most urgent compaction, if any level is over its budget
pub fn pick_compaction(state: &LevelState, opts: &crate::config::Options) -> Option<CompactionPlan> {
    let last = state.levels.len().checked_sub(1)?;
    let mut best: Option<(f64, usize)> = None;
    for level in 0..last {
        let score = if level == 0 {
            state.levels[0].len() as f64 / opts.l0_compaction_trigger as f64
        } else {
            state.level_bytes(level) as f64 / opts.level_max_bytes(level) as f64
        };
        if score >= 1.0 && best.map_or(true, |(s, _)| score > s) {
            best = Some((score, level));
        }
    }
    let (_, level) = best?;

    let inputs: Vec<Arc<SSTable>> = if level == 0 {
        state.levels[0].clone()
    } else {
        state.levels[level]
            .iter()
            .max_by_key(|t| t.meta().size)
            .cloned()
            .into_iter()
            .collect()
    };
    let smallest = inputs.iter().map(|t| t.meta().smallest.clone()).min()?;
    let largest = inputs.iter().map(|t| t.meta().largest.clone()).max()?;

    let targets = state.levels[level + 1]
        .iter()
        .filter(|t| t.overlaps(&smallest, &largest))
        .cloned()
        .collect();

    Some(CompactionPlan {
        level,
        inputs,
        targets,
    })
}

struct MergeOutput {
    tables: Vec<Arc<SSTable>>,
    discarded: Vec<ValuePtr>,
    dropped: u64,
}

impl LevelManager {
    /// Run at most one compaction. Returns whether one ran.
    pub fn compact_once(&self) -> Result<bool> {
        let _guard = self.compaction_lock.lock();
        self.check_open()?;

        let state = self.snapshot();
        let Some(plan) = pick_compaction(&state, &self.opts) else {
            return Ok(false);
        };
        let output_level = plan.output_level();
        debug!(
            level = plan.level,
            inputs = plan.inputs.len(),
            targets = plan.targets.len(),
            "Starting compaction"
        );

        let mut written: Vec<PathBuf> = Vec::new();
        let output = match self.merge(&plan, &state, &mut written) {
            Ok(output) => output,
            Err(e) => {
                for path in written {
                    if let Err(err) = std::fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %err, "Failed to remove partial compaction output");
                    }
                }
                return Err(e);
            }
        };

        let mut edit = VersionEdit::new();
        for table in &plan.inputs {
            edit.remove_table(plan.level, table.id());
        }
        for table in &plan.targets {
            edit.remove_table(output_level, table.id());
        }
        for table in &output.tables {
            edit.add_table(output_level, table.meta().clone());
        }
        let added = output.tables.iter().map(|t| (output_level, Arc::clone(t))).collect();
        self.install(&edit, added)?;
        self.report_discards(&output.discarded);

        let bytes_read: u64 = plan.inputs.iter().chain(&plan.targets).map(|t| t.meta().size).sum();
        let bytes_written: u64 = output.tables.iter().map(|t| t.meta().size).sum();
        {
            let mut stats = self.stats.lock();
            stats.num_compactions += 1;
            stats.bytes_read += bytes_read;
            stats.bytes_written += bytes_written;
            stats.entries_dropped += output.dropped;
        }
        info!(
            from = plan.level,
            to = output_level,
            inputs = plan.inputs.len() + plan.targets.len(),
            outputs = output.tables.len(),
            bytes_read,
            bytes_written,
            dropped = output.dropped,
            "Compaction finished"
        );
        Ok(true)
    }

    /// Keep compacting until no level is over budget
    pub fn compact_until_settled(&self) -> Result<usize> {
        let mut rounds = 0;
        while self.compact_once()? {
            rounds += 1;
        }
        Ok(rounds)
    }

    fn merge(
        &self,
        plan: &CompactionPlan,
        state: &LevelState,
        written: &mut Vec<PathBuf>,
    ) -> Result<MergeOutput> {
        let output_level = plan.output_level();

        // Newest sources first so exact sequence ties resolve toward them
        let mut sources: Vec<EntryIterator> = Vec::new();
        for table in plan.inputs.iter().rev() {
            sources.push(Box::new(table.iter()));
        }
        for table in &plan.targets {
            sources.push(Box::new(table.iter()));
        }

        let now = now_unix_secs();
        let mut out = MergeOutput {
            tables: Vec::new(),
            discarded: Vec::new(),
            dropped: 0,
        };
        let mut builder: Option<(u64, SSTableBuilder)> = None;
        let mut last_key: Option<Vec<u8>> = None;

        for item in MergingIterator::all_versions(sources) {
            let entry = item?;
            if last_key.as_deref() == Some(entry.key.as_slice()) {
                out.discarded.extend(entry.value.as_pointer());
                continue;
            }
            last_key = Some(entry.key.clone());

            if (entry.deleted || entry.is_expired_at(now))
                && !state.key_may_exist_below(output_level, &entry.key)
            {
                out.discarded.extend(entry.value.as_pointer());
                out.dropped += 1;
                continue;
            }

            if builder.is_none() {
                let id = self.allocate_table_id();
                let path = self.table_path(id);
                written.push(path.clone());
                builder = Some((id, SSTableBuilder::new(&path, id, &self.opts)?));
            }
            if let Some((_, b)) = builder.as_mut() {
                b.add(&entry)?;
                if b.estimated_size() >= self.opts.table_size {
                    if let Some((id, b)) = builder.take() {
                        out.tables.push(self.finish_output(id, b)?);
                    }
                }
            }
        }
        if let Some((id, b)) = builder.take() {
            out.tables.push(self.finish_output(id, b)?);
        }
        Ok(out)
    }

    fn finish_output(&self, id: u64, builder: SSTableBuilder) -> Result<Arc<SSTable>> {
        builder.finish()?;
        Ok(Arc::new(SSTable::open(&self.table_path(id), id)?))
    }
}
