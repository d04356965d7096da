//! LSM-Tree Storage Engine
//!
//! ## Architecture
//! - **MemTable**: WAL-backed lock-free-read skip list (write buffer)
//! - **SSTable**: Sorted String Table with bloom filter (disk persistence)
//! - **Levels**: L0 overlapping, L1+ disjoint, layout tracked by the manifest
//! - **Compaction**: Background leveled merge
//!
//! Values themselves may live in the value log; the tree only ever sees the
//! pointer (see [`crate::storage::vlog`]).

mod bloom;
mod compaction;
mod engine;
mod levels;
mod memtable;
mod merging_iterator;
mod skiplist;
mod sstable;
mod wal;

pub use bloom::BloomFilter;
pub use compaction::{pick_compaction, CompactionPlan, CompactionStats};
pub use engine::{LsmTree, MemTableStats};
pub use levels::{DiscardHook, LevelManager, LevelStat, LevelState};
pub use memtable::MemTable;
pub use merging_iterator::{EntryIterator, MergingIterator};
pub use skiplist::{SkipList, SkipListIter};
pub use sstable::{SSTable, SSTableBuilder, SSTableIterator};
pub use wal::Wal;
