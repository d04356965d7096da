//! Manifest: durable record of which tables make up each level
//!
//! ## Guarantees
//! 1. **Atomic edits**: a flush or compaction is one checksummed record
//! 2. **Replay before open**: the level layout is rebuilt before any table is opened
//! 3. **Bounded size**: the log is periodically rewritten as a snapshot

mod manifest;
mod version;

pub use manifest::{Manifest, ManifestRecord};
pub use version::{TableMeta, Version, VersionEdit};
