//! Point operations and iteration

use crate::iterator::{resolve_value, DbIterator, IteratorOptions};
use crate::stats::StatEvent;
use crate::storage::codec::{Entry, ValueData};
use crate::{Result, StorageError};

use super::Db;

impl Db {
    /// Insert or overwrite one key.
    ///
    /// Values longer than `value_threshold` are appended to the value log
    /// first; the index then stores a pointer to them.
    pub fn set(&self, mut entry: Entry) -> Result<()> {
        self.check_open()?;
        if entry.key.is_empty() {
            return Err(StorageError::InvalidArgument("key must not be empty".into()));
        }
        let value_len = match &entry.value {
            ValueData::Literal(v) => v.len(),
            ValueData::Pointer(_) => {
                return Err(StorageError::InvalidArgument(
                    "entries must carry a literal value".into(),
                ))
            }
        };
        entry.check_size()?;

        let in_vlog = !entry.deleted && value_len > self.opts.value_threshold;
        if in_vlog {
            let ptr = self.vlog.write(&entry)?;
            entry.value = ValueData::Pointer(ptr);
        }
        let bytes = (entry.key.len() + value_len) as u64;
        self.lsm.set(entry)?;
        self.stats.record(StatEvent::Set { bytes, in_vlog });
        Ok(())
    }

    /// Current value of `key`. Deleted and expired keys read as `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.check_open()?;
        let _pin = self.vlog.pin();
        let found = match self.lsm.get(key)? {
            Some(entry) if !entry.is_dead() => Some(resolve_value(&self.vlog, entry)?),
            _ => None,
        };
        self.stats.record(StatEvent::Get { hit: found.is_some() });
        Ok(found)
    }

    /// Delete `key` by writing a tombstone
    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        if key.is_empty() {
            return Err(StorageError::InvalidArgument("key must not be empty".into()));
        }
        self.lsm.set(Entry::tombstone(key))?;
        self.stats.record(StatEvent::Del);
        Ok(())
    }

    /// Live entries under `opts.prefix`, values resolved
    pub fn iter(&self, opts: IteratorOptions) -> Result<DbIterator> {
        self.check_open()?;
        let pin = self.vlog.pin();
        let source = self.lsm.scan(&opts.prefix)?;
        DbIterator::new(source, pin, opts.ascending)
    }
}
