//! Entry and value-pointer encoding
//!
//! ## Entry Format
//! ```text
//! [meta: u8][seq: u64][expires_at: u64][key_len: u32][key][value_len: u32][value]
//! ```
//! `meta` carries [`META_DELETED`] and [`META_POINTER`]. When the pointer bit
//! is set, `value` is an encoded [`ValuePtr`]; otherwise it is the literal
//! value. The bit is decoded up front into [`ValueData`], so no layer above
//! the codec ever guesses at what the value bytes mean.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::storage::checksum::MAX_RECORD_SIZE;
use crate::{Result, StorageError};

/// Tombstone marker
pub const META_DELETED: u8 = 1 << 0;
/// Value bytes hold a [`ValuePtr`]
pub const META_POINTER: u8 = 1 << 1;

/// Encoded size of a [`ValuePtr`]
pub const VALUE_PTR_SIZE: usize = 16;

const ENTRY_FIXED_SIZE: usize = 1 + 8 + 8 + 4 + 4;

/// Location of one record in the value log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValuePtr {
    /// Value-log file id
    pub fid: u32,
    /// Byte offset of the record inside the file
    pub offset: u64,
    /// Length of the whole framed record
    pub len: u32,
}

impl ValuePtr {
    pub fn encode(&self) -> [u8; VALUE_PTR_SIZE] {
        let mut buf = [0u8; VALUE_PTR_SIZE];
        buf[0..4].copy_from_slice(&self.fid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != VALUE_PTR_SIZE {
            return Err(StorageError::Corruption(format!(
                "value pointer must be {} bytes, got {}",
                VALUE_PTR_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            fid: read_u32(buf, 0),
            len: read_u32(buf, 4),
            offset: read_u64(buf, 8),
        })
    }
}

/// Value storage type
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueData {
    /// Value stored next to the key
    Literal(Vec<u8>),
    /// Value stored in the value log
    Pointer(ValuePtr),
}

impl ValueData {
    /// Size of the bytes stored in the index for this value
    pub fn encoded_len(&self) -> usize {
        match self {
            ValueData::Literal(v) => v.len(),
            ValueData::Pointer(_) => VALUE_PTR_SIZE,
        }
    }

    pub fn as_literal(&self) -> Option<&[u8]> {
        match self {
            ValueData::Literal(v) => Some(v),
            ValueData::Pointer(_) => None,
        }
    }

    pub fn as_pointer(&self) -> Option<ValuePtr> {
        match self {
            ValueData::Literal(_) => None,
            ValueData::Pointer(p) => Some(*p),
        }
    }
}

/// A versioned key-value record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: ValueData,
    /// Last Unix second in which the entry is visible; 0 means never expires
    pub expires_at: u64,
    /// Tombstone marker
    pub deleted: bool,
    /// Assigned by the engine at write time; higher wins among equal keys
    pub seq: u64,
}

impl Entry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: ValueData::Literal(value.into()),
            expires_at: 0,
            deleted: false,
            seq: 0,
        }
    }

    pub fn tombstone(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: ValueData::Literal(Vec::new()),
            expires_at: 0,
            deleted: true,
            seq: 0,
        }
    }

    /// Keep the entry visible for at least `ttl`. Expiry has whole-second
    /// granularity, so it may outlive `ttl` by up to one second.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        self.expires_at = now_unix_secs() + secs.max(1);
        self
    }

    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_unix_secs())
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at != 0 && self.expires_at < now
    }

    /// Tombstones and expired entries hide every older version of the key
    pub fn is_dead(&self) -> bool {
        self.deleted || self.is_expired()
    }

    pub fn meta(&self) -> u8 {
        let mut meta = 0;
        if self.deleted {
            meta |= META_DELETED;
        }
        if matches!(self.value, ValueData::Pointer(_)) {
            meta |= META_POINTER;
        }
        meta
    }

    pub fn encoded_len(&self) -> usize {
        ENTRY_FIXED_SIZE + self.key.len() + self.value.encoded_len()
    }

    /// Entries must fit in one log record, or recovery would read them as
    /// a damaged tail
    pub fn check_size(&self) -> Result<()> {
        let len = self.encoded_len();
        if len > MAX_RECORD_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "entry of {} bytes exceeds the {} byte record limit",
                len, MAX_RECORD_SIZE
            )));
        }
        Ok(())
    }

    /// Rough in-memory footprint used for memtable accounting
    pub fn estimated_size(&self) -> usize {
        self.encoded_len() + 48
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.meta());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.expires_at.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);
        match &self.value {
            ValueData::Literal(v) => {
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(v);
            }
            ValueData::Pointer(p) => {
                buf.extend_from_slice(&(VALUE_PTR_SIZE as u32).to_le_bytes());
                buf.extend_from_slice(&p.encode());
            }
        }
    }

    /// Decode a buffer holding exactly one entry
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (entry, used) = Self::decode_prefix(buf)?;
        if used != buf.len() {
            return Err(StorageError::Corruption(format!(
                "{} trailing bytes after entry",
                buf.len() - used
            )));
        }
        Ok(entry)
    }

    /// Decode the entry at the start of `buf`, returning it and the bytes consumed
    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < ENTRY_FIXED_SIZE {
            return Err(StorageError::Corruption(format!(
                "entry header needs {} bytes, got {}",
                ENTRY_FIXED_SIZE,
                buf.len()
            )));
        }
        let meta = buf[0];
        let seq = read_u64(buf, 1);
        let expires_at = read_u64(buf, 9);
        let key_len = read_u32(buf, 17) as usize;

        let key_end = 21 + key_len;
        if buf.len() < key_end + 4 {
            return Err(StorageError::Corruption("entry key overruns buffer".into()));
        }
        let key = buf[21..key_end].to_vec();
        let value_len = read_u32(buf, key_end) as usize;
        let value_start = key_end + 4;
        let value_end = value_start + value_len;
        if buf.len() < value_end {
            return Err(StorageError::Corruption("entry value overruns buffer".into()));
        }
        let raw = &buf[value_start..value_end];

        let value = if meta & META_POINTER != 0 {
            ValueData::Pointer(ValuePtr::decode(raw)?)
        } else {
            ValueData::Literal(raw.to_vec())
        };

        Ok((
            Self {
                key,
                value,
                expires_at,
                deleted: meta & META_DELETED != 0,
                seq,
            },
            value_end,
        ))
    }
}

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_flag_survives_encoding() {
        let ptr = ValuePtr { fid: 7, offset: 4096, len: 1200 };
        let mut entry = Entry::new("big", Vec::<u8>::new());
        entry.value = ValueData::Pointer(ptr);
        entry.seq = 42;

        let decoded = Entry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded.value.as_pointer(), Some(ptr));
        assert_eq!(decoded.meta() & META_POINTER, META_POINTER);
        assert_eq!(decoded.seq, 42);
    }

    #[test]
    fn test_literal_that_looks_like_pointer_stays_literal() {
        let ptr = ValuePtr { fid: 1, offset: 2, len: 3 };
        let entry = Entry::new("k", ptr.encode().to_vec());
        let decoded = Entry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded.value, ValueData::Literal(ptr.encode().to_vec()));
    }

    #[test]
    fn test_decode_prefix_walks_concatenated_entries() {
        let mut buf = Vec::new();
        Entry::new("a", "1").encode_into(&mut buf);
        Entry::tombstone("b").encode_into(&mut buf);

        let (first, used) = Entry::decode_prefix(&buf).unwrap();
        assert_eq!(first.key, b"a");
        let (second, rest) = Entry::decode_prefix(&buf[used..]).unwrap();
        assert!(second.deleted);
        assert_eq!(used + rest, buf.len());
    }

    #[test]
    fn test_truncated_entry_is_corruption() {
        let buf = Entry::new("key", "value").encode();
        let err = Entry::decode(&buf[..buf.len() - 2]).unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let limit = MAX_RECORD_SIZE - ENTRY_FIXED_SIZE - 1;
        assert!(Entry::new("k", vec![0u8; limit]).check_size().is_ok());
        let err = Entry::new("k", vec![0u8; limit + 1]).check_size().unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn test_ttl_expiry() {
        let entry = Entry::new("k", "v").with_ttl(Duration::from_millis(10));
        assert!(!entry.is_expired());
        assert!(!entry.is_expired_at(entry.expires_at));
        assert!(entry.is_expired_at(entry.expires_at + 1));
        assert!(!Entry::new("k", "v").is_expired_at(u64::MAX));
    }

    #[test]
    fn test_ttl_lasts_whole_duration_late_in_a_second() {
        // Whatever the sub-second phase at write time, the entry must still be
        // visible one full TTL later.
        let start = now_unix_secs();
        let entry = Entry::new("k", "v").with_ttl(Duration::from_secs(1));
        assert!(entry.expires_at >= start + 1);
        // Written at start + 0.999s, read at start + 1.999s
        assert!(!entry.is_expired_at(start + 1));
        let entry = Entry::new("k", "v").with_ttl(Duration::from_millis(1500));
        assert!(!entry.is_expired_at(start + 2));
    }
}
