//! Streaming k-way merge over sorted entry sources
//!
//! Sources (memtables, SSTables) each yield entries in ascending key order.
//! A min-heap holds the head of every source, so memory stays at one entry
//! per source regardless of data size.
//!
//! ## Ordering
//! 1. key ascending
//! 2. sequence number descending (newest version first)
//! 3. source id ascending (earlier sources win exact ties)
//!
//! Tombstones are passed through; callers decide whether they hide a key or
//! get dropped. A source error is yielded once and ends the merge.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::storage::codec::Entry;
use crate::{Result, StorageError};

pub type EntryIterator = Box<dyn Iterator<Item = Result<Entry>> + Send>;

#[derive(Debug)]
struct HeapItem {
    entry: Entry,
    source_id: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry
            .key
            .cmp(&other.entry.key)
            .then(other.entry.seq.cmp(&self.entry.seq))
            .then(self.source_id.cmp(&other.source_id))
    }
}

pub struct MergingIterator {
    heap: BinaryHeap<Reverse<HeapItem>>,
    sources: Vec<EntryIterator>,
    /// Only the newest version of each key is yielded
    dedup: bool,
    last_key: Option<Vec<u8>>,
    error: Option<StorageError>,
    finished: bool,
}

impl MergingIterator {
    /// Merge yielding the newest version of every key
    pub fn new(sources: Vec<EntryIterator>) -> Self {
        Self::build(sources, true)
    }

    /// Merge yielding every version, newest first within a key
    pub fn all_versions(sources: Vec<EntryIterator>) -> Self {
        Self::build(sources, false)
    }

    fn build(sources: Vec<EntryIterator>, dedup: bool) -> Self {
        let mut iter = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            dedup,
            last_key: None,
            error: None,
            finished: false,
        };
        for source_id in 0..iter.sources.len() {
            iter.refill(source_id);
        }
        iter
    }

    fn refill(&mut self, source_id: usize) {
        if self.error.is_some() {
            return;
        }
        let Some(source) = self.sources.get_mut(source_id) else {
            return;
        };
        match source.next() {
            Some(Ok(entry)) => self.heap.push(Reverse(HeapItem { entry, source_id })),
            Some(Err(e)) => self.error = Some(e),
            None => {}
        }
    }
}

impl Iterator for MergingIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(e) = self.error.take() {
                self.finished = true;
                return Some(Err(e));
            }
            let Some(Reverse(item)) = self.heap.pop() else {
                self.finished = true;
                return None;
            };
            self.refill(item.source_id);

            if self.dedup {
                if self.last_key.as_deref() == Some(item.entry.key.as_slice()) {
                    continue;
                }
                self.last_key = Some(item.entry.key.clone());
            }
            return Some(Ok(item.entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(entries: Vec<(&str, u64, bool)>) -> EntryIterator {
        let items: Vec<Result<Entry>> = entries
            .into_iter()
            .map(|(k, seq, deleted)| {
                let mut e = if deleted {
                    Entry::tombstone(k)
                } else {
                    Entry::new(k, format!("{}@{}", k, seq))
                };
                e.seq = seq;
                Ok(e)
            })
            .collect();
        Box::new(items.into_iter())
    }

    fn keys_and_seqs(iter: MergingIterator) -> Vec<(String, u64)> {
        iter.map(|r| {
            let e = r.unwrap();
            (String::from_utf8(e.key).unwrap(), e.seq)
        })
        .collect()
    }

    #[test]
    fn test_basic_merge() {
        let merged = MergingIterator::new(vec![
            source(vec![("a", 1, false), ("c", 3, false)]),
            source(vec![("b", 2, false), ("d", 4, false)]),
        ]);
        let keys: Vec<_> = keys_and_seqs(merged).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_newest_version_wins() {
        let merged = MergingIterator::new(vec![
            source(vec![("k", 3, false)]),
            source(vec![("k", 9, false), ("z", 1, false)]),
            source(vec![("k", 5, false)]),
        ]);
        assert_eq!(
            keys_and_seqs(merged),
            vec![("k".to_string(), 9), ("z".to_string(), 1)]
        );
    }

    #[test]
    fn test_tombstones_pass_through() {
        let merged = MergingIterator::new(vec![
            source(vec![("k", 1, false)]),
            source(vec![("k", 2, true)]),
        ]);
        let out: Vec<Entry> = merged.map(|r| r.unwrap()).collect();
        assert_eq!(out.len(), 1);
        assert!(out[0].deleted);
    }

    #[test]
    fn test_all_versions_ordered_newest_first() {
        let merged = MergingIterator::all_versions(vec![
            source(vec![("a", 1, false), ("b", 4, false)]),
            source(vec![("a", 7, true)]),
        ]);
        assert_eq!(
            keys_and_seqs(merged),
            vec![("a".to_string(), 7), ("a".to_string(), 1), ("b".to_string(), 4)]
        );
    }

    #[test]
    fn test_source_error_surfaces() {
        let failing: EntryIterator = Box::new(
            vec![Err(StorageError::Corruption("bad block".into()))].into_iter(),
        );
        let mut merged = MergingIterator::new(vec![source(vec![("a", 1, false)]), failing]);
        assert!(matches!(merged.next(), Some(Err(StorageError::Corruption(_)))));
        assert!(merged.next().is_none());
    }
}
