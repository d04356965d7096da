//! minikv Storage Engine
//!
//! Embedded key-value store on a log-structured merge tree, with large
//! values separated into a value log.
//!
//! ## Architecture
//! - Write path: value log (large values) → WAL → skip-list memtable
//! - Disk: leveled SSTables with bloom filters, tracked by a manifest
//! - Background: compaction, value-log GC, stats aggregation
//!
//! ```no_run
//! use minikv::{Db, Entry, Options};
//!
//! let db = Db::open(Options::new("/tmp/minikv"))?;
//! db.set(Entry::new("hello", "minikv"))?;
//! assert!(db.get(b"hello")?.is_some());
//! db.close()?;
//! # Ok::<(), minikv::StorageError>(())
//! ```

pub mod config;
pub mod db;
pub mod iterator;
pub mod stats;
pub mod storage;
pub mod task;

mod error;

pub use config::Options;
pub use db::{Db, DbStats};
pub use error::{Result, StorageError};
pub use iterator::{DbIterator, IteratorOptions};
pub use stats::StatsSnapshot;
pub use storage::codec::{Entry, ValueData, ValuePtr};
