//! Arena-backed concurrent skip list
//!
//! The ordered index inside every memtable.
//!
//! ## Architecture
//! - Nodes live in a segmented arena and are addressed by `u32` index. The
//!   arena only grows; nodes are never freed while the list is alive, so an
//!   index read by a reader stays valid.
//! - Forward links are `AtomicU32`. A writer installs the whole tower of a new
//!   node first, then publishes it bottom-up with `Release` stores into the
//!   predecessors. Readers follow links with `Acquire` loads and never lock.
//! - Writers serialize on one mutex.
//! - Re-adding a key inserts a new node *before* the older nodes of that key,
//!   so the first node found for a key is always the most recent one.
//!
//! ## Ordering
//! Nodes are ordered by `(score, key)` where the score is the first eight key
//! bytes read big-endian. Scores order the same way the bytes do, so they only
//! short-circuit comparisons; equal scores fall back to a full byte compare.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rand::Rng;

use crate::storage::codec::Entry;
use crate::{Result, StorageError};

pub const MAX_HEIGHT: usize = 12;

/// Link value meaning "no next node"; also the id of the head tower
const NIL: u32 = 0;
const HEAD: u32 = 0;

/// The first arena segment holds 2^10 nodes, each following one twice as many
const FIRST_SEGMENT_BITS: u32 = 10;
const NUM_SEGMENTS: usize = 21;

/// Per-node bookkeeping on top of the entry itself
const NODE_OVERHEAD: usize = 8 + MAX_HEIGHT * 4;

struct Element {
    entry: Entry,
    score: u64,
}

struct Node {
    element: OnceLock<Element>,
    tower: [AtomicU32; MAX_HEIGHT],
}

impl Node {
    fn empty() -> Self {
        Self {
            element: OnceLock::new(),
            tower: std::array::from_fn(|_| AtomicU32::new(NIL)),
        }
    }
}

struct Arena {
    segments: [OnceLock<Box<[Node]>>; NUM_SEGMENTS],
    allocated: AtomicU32,
}

impl Arena {
    fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| OnceLock::new()),
            allocated: AtomicU32::new(0),
        }
    }

    /// Map a zero-based slot index to (segment, offset)
    fn locate(index: u32) -> (usize, usize) {
        let n = u64::from(index) + (1u64 << FIRST_SEGMENT_BITS);
        let bit = 63 - n.leading_zeros();
        ((bit - FIRST_SEGMENT_BITS) as usize, (n - (1u64 << bit)) as usize)
    }

    fn capacity() -> u64 {
        ((1u64 << NUM_SEGMENTS) - 1) << FIRST_SEGMENT_BITS
    }

    /// Store an element in a fresh slot and return its node id (never `NIL`).
    /// Callers must hold the list's write lock.
    fn alloc(&self, element: Element) -> Result<u32> {
        let index = self.allocated.load(Ordering::Relaxed);
        if u64::from(index) >= Self::capacity() {
            return Err(StorageError::ResourceExhausted("skiplist arena is full".into()));
        }
        let (seg, offset) = Self::locate(index);
        let segment = self.segments[seg].get_or_init(|| {
            (0..(1usize << (FIRST_SEGMENT_BITS as usize + seg)))
                .map(|_| Node::empty())
                .collect()
        });
        segment[offset]
            .element
            .set(element)
            .map_err(|_| StorageError::Corruption("skiplist arena slot reused".into()))?;
        self.allocated.store(index + 1, Ordering::Release);
        Ok(index + 1)
    }

    fn node(&self, id: u32) -> Option<&Node> {
        if id == NIL {
            return None;
        }
        let (seg, offset) = Self::locate(id - 1);
        self.segments[seg].get().map(|s| &s[offset])
    }

    fn element(&self, id: u32) -> Option<&Element> {
        self.node(id).and_then(|n| n.element.get())
    }
}

/// Concurrent ordered map from key bytes to the newest [`Entry`]
pub struct SkipList {
    head: [AtomicU32; MAX_HEIGHT],
    height: AtomicUsize,
    arena: Arena,
    write_lock: Mutex<()>,
    len: AtomicUsize,
    mem_size: AtomicUsize,
    closed: AtomicBool,
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipList {
    pub fn new() -> Self {
        Self {
            head: std::array::from_fn(|_| AtomicU32::new(NIL)),
            height: AtomicUsize::new(1),
            arena: Arena::new(),
            write_lock: Mutex::new(()),
            len: AtomicUsize::new(0),
            mem_size: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Insert an entry. A later add of the same key shadows earlier ones.
    pub fn add(&self, entry: Entry) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let _guard = self.write_lock.lock();

        let score = calc_score(&entry.key);
        let preds = self.find_predecessors(score, &entry.key, MAX_HEIGHT);
        let height = random_height();
        let size = entry.estimated_size() + NODE_OVERHEAD;

        let id = self.arena.alloc(Element { entry, score })?;
        let node = self
            .arena
            .node(id)
            .ok_or_else(|| StorageError::Corruption("skiplist node vanished".into()))?;

        for (level, &pred) in preds.iter().enumerate().take(height) {
            node.tower[level].store(self.next(pred, level), Ordering::Relaxed);
        }
        for (level, &pred) in preds.iter().enumerate().take(height) {
            if let Some(link) = self.link(pred, level) {
                link.store(id, Ordering::Release);
            }
        }

        if height > self.height.load(Ordering::Relaxed) {
            self.height.store(height, Ordering::Release);
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        self.mem_size.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    /// Newest entry for `key`, if any
    pub fn search(&self, key: &[u8]) -> Option<Entry> {
        let id = self.seek_node(key);
        self.arena
            .element(id)
            .filter(|e| e.entry.key == key)
            .map(|e| e.entry.clone())
    }

    /// Iterate newest entries in ascending key order
    pub fn iter(self: &Arc<Self>) -> SkipListIter {
        SkipListIter {
            list: Arc::clone(self),
            cursor: self.next(HEAD, 0),
            all_versions: false,
        }
    }

    /// Iterate newest entries starting at the first key `>= key`
    pub fn seek(self: &Arc<Self>, key: &[u8]) -> SkipListIter {
        SkipListIter {
            list: Arc::clone(self),
            cursor: self.seek_node(key),
            all_versions: false,
        }
    }

    /// Iterate every stored version, newest first within a key
    pub fn iter_all_versions(self: &Arc<Self>) -> SkipListIter {
        SkipListIter {
            list: Arc::clone(self),
            cursor: self.next(HEAD, 0),
            all_versions: true,
        }
    }

    /// Refuse further writes; entries already handed out are unaffected
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of stored versions
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate bytes held by the list
    pub fn mem_size(&self) -> usize {
        self.mem_size.load(Ordering::Relaxed)
    }

    /// First node whose key is `>= key`
    fn seek_node(&self, key: &[u8]) -> u32 {
        let top = self.height.load(Ordering::Acquire);
        let preds = self.find_predecessors(calc_score(key), key, top);
        self.next(preds[0], 0)
    }

    /// For each level below `top`, the last node whose key is `< key`
    fn find_predecessors(&self, score: u64, key: &[u8], top: usize) -> [u32; MAX_HEIGHT] {
        let mut preds = [HEAD; MAX_HEIGHT];
        let mut prev = HEAD;
        for level in (0..top.clamp(1, MAX_HEIGHT)).rev() {
            loop {
                let next = self.next(prev, level);
                match self.arena.element(next) {
                    Some(elem) if compare(score, key, elem) == CmpOrdering::Greater => prev = next,
                    _ => break,
                }
            }
            preds[level] = prev;
        }
        preds
    }

    fn link(&self, id: u32, level: usize) -> Option<&AtomicU32> {
        if id == HEAD {
            Some(&self.head[level])
        } else {
            self.arena.node(id).map(|n| &n.tower[level])
        }
    }

    fn next(&self, id: u32, level: usize) -> u32 {
        self.link(id, level)
            .map(|l| l.load(Ordering::Acquire))
            .unwrap_or(NIL)
    }
}

/// Owning iterator over a skip list's level-0 chain
pub struct SkipListIter {
    list: Arc<SkipList>,
    cursor: u32,
    all_versions: bool,
}

impl Iterator for SkipListIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let entry = self.list.arena.element(self.cursor)?.entry.clone();
        let mut cursor = self.list.next(self.cursor, 0);
        if !self.all_versions {
            while let Some(elem) = self.list.arena.element(cursor) {
                if elem.entry.key != entry.key {
                    break;
                }
                cursor = self.list.next(cursor, 0);
            }
        }
        self.cursor = cursor;
        Some(entry)
    }
}

fn calc_score(key: &[u8]) -> u64 {
    let mut prefix = [0u8; 8];
    let n = key.len().min(8);
    prefix[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(prefix)
}

/// Order `(score, key)` against a stored element
fn compare(score: u64, key: &[u8], elem: &Element) -> CmpOrdering {
    score
        .cmp(&elem.score)
        .then_with(|| key.cmp(elem.entry.key.as_slice()))
}

fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;
    while height < MAX_HEIGHT && rng.gen_ratio(1, 4) {
        height += 1;
    }
    height
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::ValueData;

    fn value_of(entry: &Entry) -> &[u8] {
        entry.value.as_literal().unwrap()
    }

    #[test]
    fn test_compare_uses_score_then_bytes() {
        let elem = Element {
            entry: Entry::new("2", "2"),
            score: calc_score(b"2"),
        };
        assert_eq!(compare(calc_score(b"1"), b"1", &elem), CmpOrdering::Less);

        // Same eight-byte prefix, so equal scores and a byte comparison decides
        let long = Element {
            entry: Entry::new("prefix00b", "x"),
            score: calc_score(b"prefix00b"),
        };
        assert_eq!(calc_score(b"prefix00a"), long.score);
        assert_eq!(compare(long.score, b"prefix00a", &long), CmpOrdering::Less);
    }

    #[test]
    fn test_basic_crud() {
        let list = SkipList::new();

        list.add(Entry::new("key1", "val1")).unwrap();
        assert_eq!(value_of(&list.search(b"key1").unwrap()), b"val1");

        list.add(Entry::new("key2", "val2")).unwrap();
        assert_eq!(value_of(&list.search(b"key2").unwrap()), b"val2");

        assert!(list.search(b"noexist").is_none());

        list.add(Entry::new("key1", "val1+1")).unwrap();
        assert_eq!(value_of(&list.search(b"key1").unwrap()), b"val1+1");
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_prefix_keys_do_not_alias() {
        let list = SkipList::new();
        list.add(Entry::new("prefix00a", "a")).unwrap();
        list.add(Entry::new("prefix00b", "b")).unwrap();
        list.add(Entry::new("prefix00", "short")).unwrap();

        assert_eq!(value_of(&list.search(b"prefix00a").unwrap()), b"a");
        assert_eq!(value_of(&list.search(b"prefix00b").unwrap()), b"b");
        assert_eq!(value_of(&list.search(b"prefix00").unwrap()), b"short");
        assert!(list.search(b"prefix0").is_none());
    }

    #[test]
    fn test_iter_yields_newest_in_order() {
        let list = Arc::new(SkipList::new());
        for key in ["c", "a", "b", "a"] {
            list.add(Entry::new(key, format!("{}-{}", key, list.len()))).unwrap();
        }

        let entries: Vec<_> = list.iter().collect();
        let keys: Vec<_> = entries.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(entries[0].value, ValueData::Literal(b"a-3".to_vec()));

        assert_eq!(list.iter_all_versions().count(), 4);

        let from_b: Vec<_> = list.seek(b"b").map(|e| e.key).collect();
        assert_eq!(from_b, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_closed_rejects_add() {
        let list = SkipList::new();
        list.add(Entry::new("k", "v")).unwrap();
        let held = list.search(b"k").unwrap();
        list.close();

        assert!(matches!(list.add(Entry::new("k2", "v")), Err(StorageError::Closed)));
        assert_eq!(value_of(&held), b"v");
        assert!(list.search(b"k").is_some());
    }

    #[test]
    fn test_grows_past_first_segment() {
        let list = SkipList::new();
        let n = 5000;
        for i in 0..n {
            list.add(Entry::new(format!("k{:06}", i), format!("v{}", i))).unwrap();
        }
        for i in (0..n).step_by(97) {
            let got = list.search(format!("k{:06}", i).as_bytes()).unwrap();
            assert_eq!(value_of(&got), format!("v{}", i).as_bytes());
        }
    }

    #[test]
    fn test_concurrent_basic() {
        const N: usize = 1000;
        let list = Arc::new(SkipList::new());
        let key = |i: usize| format!("{:05}", i).into_bytes();

        std::thread::scope(|s| {
            for t in 0..8 {
                let list = &list;
                s.spawn(move || {
                    for i in (t..N).step_by(8) {
                        list.add(Entry::new(key(i), key(i))).unwrap();
                    }
                });
            }
            // Readers racing the writers see either nothing or the right value
            for _ in 0..4 {
                let list = &list;
                s.spawn(move || {
                    for i in 0..N {
                        if let Some(e) = list.search(&key(i)) {
                            assert_eq!(e.value.as_literal().unwrap(), key(i).as_slice());
                        }
                    }
                });
            }
        });

        for i in 0..N {
            let e = list.search(&key(i)).expect("key lost");
            assert_eq!(value_of(&e), key(i).as_slice());
        }
        assert_eq!(list.iter().count(), N);
    }
}
