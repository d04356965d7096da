//! User-facing iteration over live entries
//!
//! Wraps the engine's merged scan: tombstones and expired entries are
//! skipped, value-log pointers are resolved one entry at a time. Descending
//! order collects the (unresolved) index entries first and walks them back.
//! The iterator pins the value log, so GC cannot delete a file any of its
//! pointers lead to.

use crate::storage::codec::{now_unix_secs, Entry, ValueData};
use crate::storage::lsm::EntryIterator;
use crate::storage::vlog::{ReadPin, ValueLog};
use crate::{Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorOptions {
    /// Only keys starting with this prefix; empty means all keys
    pub prefix: Vec<u8>,
    pub ascending: bool,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self {
            prefix: Vec::new(),
            ascending: true,
        }
    }
}

impl IteratorOptions {
    pub fn with_prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn reversed(mut self) -> Self {
        self.ascending = !self.ascending;
        self
    }
}

enum Source {
    Forward(EntryIterator),
    Backward(std::iter::Rev<std::vec::IntoIter<Entry>>),
}

pub struct DbIterator {
    source: Source,
    pin: ReadPin,
    /// Expiry is judged against the time the iterator was created
    now: u64,
    done: bool,
}

impl DbIterator {
    /// `pin` must have been taken before `source` was built
    pub(crate) fn new(source: EntryIterator, pin: ReadPin, ascending: bool) -> Result<Self> {
        let now = now_unix_secs();
        let source = if ascending {
            Source::Forward(source)
        } else {
            let mut live = Vec::new();
            for item in source {
                let entry = item?;
                if !is_hidden(&entry, now) {
                    live.push(entry);
                }
            }
            Source::Backward(live.into_iter().rev())
        };
        Ok(Self {
            source,
            pin,
            now,
            done: false,
        })
    }

    fn next_raw(&mut self) -> Option<Result<Entry>> {
        match &mut self.source {
            Source::Forward(iter) => iter.next(),
            Source::Backward(iter) => iter.next().map(Ok),
        }
    }
}

impl Iterator for DbIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let entry = match self.next_raw()? {
                Ok(entry) => entry,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if is_hidden(&entry, self.now) {
                continue;
            }
            let resolved = resolve_value(self.pin.vlog(), entry);
            if resolved.is_err() {
                self.done = true;
            }
            return Some(resolved);
        }
    }
}

fn is_hidden(entry: &Entry, now: u64) -> bool {
    entry.deleted || entry.is_expired_at(now)
}

/// Replace a value-log pointer with the value it points at
pub(crate) fn resolve_value(vlog: &ValueLog, mut entry: Entry) -> Result<Entry> {
    let ValueData::Pointer(ptr) = entry.value else {
        return Ok(entry);
    };
    let stored = vlog.read(&ptr)?;
    if stored.key != entry.key {
        return Err(StorageError::Corruption(format!(
            "value log record at {}:{} belongs to another key",
            ptr.fid, ptr.offset
        )));
    }
    entry.value = stored.value;
    Ok(entry)
}
