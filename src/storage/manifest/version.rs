//! Level layout and the edits that move it forward

use serde::{Deserialize, Serialize};

/// Persistent description of one SSTable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    /// Table id; the file is `{id:06}.sst`
    pub id: u64,
    /// File size in bytes
    pub size: u64,
    pub num_entries: u64,
    /// Smallest key in the table
    pub smallest: Vec<u8>,
    /// Largest key in the table
    pub largest: Vec<u8>,
    /// Highest sequence number stored in the table
    pub max_seq: u64,
}

/// An atomic change to the level layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEdit {
    /// (level, table) pairs to add
    pub added: Vec<(usize, TableMeta)>,
    /// (level, table id) pairs to remove
    pub removed: Vec<(usize, u64)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, level: usize, meta: TableMeta) {
        self.added.push((level, meta));
    }

    pub fn remove_table(&mut self, level: usize, id: u64) {
        self.removed.push((level, id));
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Which tables live on which level
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// `levels[0]` in flush order (oldest first); deeper levels sorted by smallest key
    pub levels: Vec<Vec<TableMeta>>,
    /// Next table id to hand out; never goes backwards
    pub next_table_id: u64,
}

impl Version {
    pub fn new(num_levels: usize) -> Self {
        Self {
            levels: vec![Vec::new(); num_levels],
            next_table_id: 1,
        }
    }

    pub fn apply(&mut self, edit: &VersionEdit) {
        for (level, id) in &edit.removed {
            if let Some(tables) = self.levels.get_mut(*level) {
                tables.retain(|t| t.id != *id);
            }
        }
        for (level, meta) in &edit.added {
            if self.levels.len() <= *level {
                self.levels.resize(*level + 1, Vec::new());
            }
            let tables = &mut self.levels[*level];
            if *level == 0 {
                tables.push(meta.clone());
            } else {
                let pos = tables.partition_point(|t| t.smallest < meta.smallest);
                tables.insert(pos, meta.clone());
            }
            self.next_table_id = self.next_table_id.max(meta.id + 1);
        }
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn contains_table(&self, id: u64) -> bool {
        self.levels.iter().flatten().any(|t| t.id == id)
    }

    pub fn max_seq(&self) -> u64 {
        self.levels
            .iter()
            .flatten()
            .map(|t| t.max_seq)
            .max()
            .unwrap_or(0)
    }
}
