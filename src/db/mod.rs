//! Database facade
//!
//! # Module Structure
//! - `core`: `Db` struct, open / close and background GC wiring
//! - `crud`: set, get, del and iteration
//! - `maintenance`: flush, compaction, value-log GC and stats

pub mod core;
pub mod crud;
pub mod maintenance;

pub use self::core::Db;
pub use self::maintenance::DbStats;
