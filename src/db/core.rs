//! Db structure and lifecycle
//!
//! Open order: value log, then the LSM tree (its discard hook feeds the value
//! log's GC statistics), then the stats aggregator, then the GC task.
//! Between the LSM tree and the GC task, discard statistics for sealed
//! value-log files are rebuilt from the index.
//! Close runs the same list backwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::config::Options;
use crate::stats::{StatEvent, Stats};
use crate::storage::lsm::{DiscardHook, LsmTree};
use crate::storage::vlog::ValueLog;
use crate::task::{BackgroundTask, TaskControl};
use crate::{Result, StorageError};

/// Embedded key-value store
pub struct Db {
    pub(crate) opts: Arc<Options>,
    pub(crate) vlog: Arc<ValueLog>,
    pub(crate) lsm: Arc<LsmTree>,
    pub(crate) stats: Arc<Stats>,
    gc_task: Mutex<Option<BackgroundTask>>,
    closed: AtomicBool,
}

impl Db {
    /// Open (or create) a store under `opts.dir`
    pub fn open(opts: Options) -> Result<Self> {
        opts.validate()?;
        std::fs::create_dir_all(&opts.dir)?;
        let opts = Arc::new(opts);

        let vlog = Arc::new(ValueLog::open(Arc::clone(&opts))?);
        let lsm = LsmTree::open(Arc::clone(&opts), Some(discard_hook(Arc::downgrade(&vlog))))?;
        if vlog.file_ids().len() > 1 {
            vlog.rebuild_discards(lsm.scan(&[])?)?;
        }
        let stats = Arc::new(Stats::start()?);

        let gc_task = BackgroundTask::spawn_periodic(
            "vlog-gc",
            opts.vlog_gc_interval(),
            gc_job(
                Arc::downgrade(&vlog),
                Arc::downgrade(&lsm),
                Arc::downgrade(&stats),
                opts.vlog_gc_discard_ratio,
            ),
        )?;

        info!(dir = %opts.dir.display(), "Database opened");
        Ok(Self {
            opts,
            vlog,
            lsm,
            stats,
            gc_task: Mutex::new(Some(gc_task)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Stop background work and make everything durable. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let task = self.gc_task.lock().take();
        if let Some(mut task) = task {
            task.stop();
        }
        let lsm_result = self.lsm.close();
        let vlog_result = self.vlog.close();
        self.stats.close();
        info!(dir = %self.opts.dir.display(), "Database closed");
        lsm_result.and(vlog_result)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Error closing database");
        }
    }
}

fn discard_hook(vlog: Weak<ValueLog>) -> DiscardHook {
    Arc::new(move |ptrs| {
        if let Some(vlog) = vlog.upgrade() {
            vlog.add_discards(ptrs);
        }
    })
}

fn gc_job(
    vlog: Weak<ValueLog>,
    lsm: Weak<LsmTree>,
    stats: Weak<Stats>,
    discard_ratio: f64,
) -> impl FnMut() -> Result<TaskControl> + Send + 'static {
    move || {
        let (Some(vlog), Some(lsm)) = (vlog.upgrade(), lsm.upgrade()) else {
            return Ok(TaskControl::Exit);
        };
        if lsm.is_closed() {
            return Ok(TaskControl::Exit);
        }
        if let Some(run) = vlog.run_gc(lsm.as_ref(), discard_ratio)? {
            if let Some(stats) = stats.upgrade() {
                stats.record(StatEvent::GcRun {
                    rewritten: run.records_rewritten,
                    reclaimed: run.bytes_reclaimed,
                });
            }
        }
        Ok(TaskControl::Continue)
    }
}
