//! Operation counters fed through a channel
//!
//! Foreground calls only send a small event; one aggregator thread folds the
//! events into a [`StatsSnapshot`]. Sends never block and never fail the
//! operation that produced them.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatEvent {
    Set { bytes: u64, in_vlog: bool },
    Get { hit: bool },
    Del,
    GcRun { rewritten: u64, reclaimed: u64 },
}

/// Point-in-time operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sets: u64,
    pub gets: u64,
    pub get_hits: u64,
    pub dels: u64,
    pub bytes_written: u64,
    pub vlog_writes: u64,
    pub gc_runs: u64,
    pub gc_rewritten: u64,
    pub gc_reclaimed_bytes: u64,
}

impl StatsSnapshot {
    fn apply(&mut self, event: StatEvent) {
        match event {
            StatEvent::Set { bytes, in_vlog } => {
                self.sets += 1;
                self.bytes_written += bytes;
                if in_vlog {
                    self.vlog_writes += 1;
                }
            }
            StatEvent::Get { hit } => {
                self.gets += 1;
                if hit {
                    self.get_hits += 1;
                }
            }
            StatEvent::Del => self.dels += 1,
            StatEvent::GcRun { rewritten, reclaimed } => {
                self.gc_runs += 1;
                self.gc_rewritten += rewritten;
                self.gc_reclaimed_bytes += reclaimed;
            }
        }
    }

    pub fn hit_rate(&self) -> f64 {
        if self.gets == 0 {
            0.0
        } else {
            self.get_hits as f64 / self.gets as f64
        }
    }
}

pub struct Stats {
    sender: Mutex<Option<Sender<StatEvent>>>,
    snapshot: Arc<RwLock<StatsSnapshot>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Stats {
    pub fn start() -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let snapshot = Arc::new(RwLock::new(StatsSnapshot::default()));
        let shared = Arc::clone(&snapshot);
        let worker = thread::Builder::new()
            .name("minikv-stats".into())
            .spawn(move || aggregate(rx, shared))?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            snapshot,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn record(&self, event: StatEvent) {
        if let Some(tx) = self.sender.lock().as_ref() {
            // Only fails once the aggregator is gone
            let _ = tx.send(event);
        }
    }

    /// Counters folded so far. Events still in flight are not included.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot.read().clone()
    }

    /// Drain outstanding events and stop the aggregator. Idempotent.
    pub fn close(&self) {
        drop(self.sender.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Stats aggregator panicked");
            }
        }
    }
}

fn aggregate(rx: Receiver<StatEvent>, snapshot: Arc<RwLock<StatsSnapshot>>) {
    for event in rx.iter() {
        let mut current = snapshot.write();
        current.apply(event);
        // Fold whatever else is queued under the same lock
        for event in rx.try_iter() {
            current.apply(event);
        }
    }
    debug!("Stats aggregator stopped");
}

impl Drop for Stats {
    fn drop(&mut self) {
        self.close();
    }
}
