//! SSTable: Sorted String Table (persistent storage)
//!
//! ## File Format
//! ```text
//! [Data Block 1] [Data Block 2] ... [Data Block N]
//! [Index Block]
//! [Bloom Filter]
//! [Footer (64 bytes)]
//! ```
//!
//! - Data block: `[flag: u8][body]`, flag 1 = Snappy-compressed body.
//!   Body is `[count: u32][entry]*` using the entry codec.
//! - Index block: smallest key, largest key, then one handle per block
//!   `(first_key, offset, size, crc32)`.
//! - Footer: offsets, sizes and CRCs of index and bloom, entry count, highest
//!   sequence number, and a CRC over the footer itself.
//!
//! Opening a table reads footer, index and bloom only; data blocks load on
//! demand and are checksum-verified on every read.
//!
//! ## Lifetime
//! Tables are shared as `Arc<SSTable>`. Once compaction retires a table it is
//! marked obsolete, and the file is removed when the last handle drops.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::bloom::BloomFilter;
use crate::config::Options;
use crate::storage::checksum::Checksum;
use crate::storage::codec::{read_u32, read_u64, Entry};
use crate::storage::hash::hash;
use crate::storage::manifest::TableMeta;
use crate::{Result, StorageError};

/// Magic number for SSTable files (ASCII "MKVT")
const SSTABLE_MAGIC: u32 = 0x4D4B_5654;

const SSTABLE_VERSION: u32 = 1;

const FOOTER_SIZE: usize = 64;

/// Blocks smaller than this are stored uncompressed
const MIN_COMPRESS_SIZE: usize = 1024;

const BLOCK_RAW: u8 = 0;
const BLOCK_SNAPPY: u8 = 1;

pub const SST_EXTENSION: &str = "sst";

pub fn table_file_name(id: u64) -> String {
    format!("{:06}.{}", id, SST_EXTENSION)
}

pub fn parse_table_id(path: &Path) -> Option<u64> {
    if path.extension()? != SST_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Location of one data block
#[derive(Clone, Debug, PartialEq, Eq)]
struct BlockHandle {
    first_key: Vec<u8>,
    offset: u64,
    size: u32,
    crc: u32,
}

/// Sparse block index plus the table's key range
#[derive(Clone, Debug, Default)]
pub struct BlockIndex {
    smallest: Vec<u8>,
    largest: Vec<u8>,
    blocks: Vec<BlockHandle>,
}

impl BlockIndex {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_bytes(&mut buf, &self.smallest);
        put_bytes(&mut buf, &self.largest);
        buf.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        for block in &self.blocks {
            put_bytes(&mut buf, &block.first_key);
            buf.extend_from_slice(&block.offset.to_le_bytes());
            buf.extend_from_slice(&block.size.to_le_bytes());
            buf.extend_from_slice(&block.crc.to_le_bytes());
        }
        buf
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        let smallest = dec.bytes()?.to_vec();
        let largest = dec.bytes()?.to_vec();
        let count = dec.u32()? as usize;
        let mut blocks = Vec::with_capacity(count.min(data.len()));
        for _ in 0..count {
            blocks.push(BlockHandle {
                first_key: dec.bytes()?.to_vec(),
                offset: dec.u64()?,
                size: dec.u32()?,
                crc: dec.u32()?,
            });
        }
        Ok(Self {
            smallest,
            largest,
            blocks,
        })
    }

    /// Index of the only block that can hold `key`
    fn find_block(&self, key: &[u8]) -> Option<usize> {
        let idx = self
            .blocks
            .partition_point(|b| b.first_key.as_slice() <= key);
        idx.checked_sub(1)
    }
}

/// SSTable footer (stored at end of file)
#[derive(Clone, Debug, PartialEq, Eq)]
struct Footer {
    index_offset: u64,
    index_size: u32,
    index_crc: u32,
    bloom_offset: u64,
    bloom_size: u32,
    bloom_crc: u32,
    num_entries: u64,
    max_seq: u64,
}

impl Footer {
    fn serialize(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..4].copy_from_slice(&SSTABLE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&SSTABLE_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.index_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.index_crc.to_le_bytes());
        buf[24..32].copy_from_slice(&self.bloom_offset.to_le_bytes());
        buf[32..36].copy_from_slice(&self.bloom_size.to_le_bytes());
        buf[36..40].copy_from_slice(&self.bloom_crc.to_le_bytes());
        buf[40..48].copy_from_slice(&self.num_entries.to_le_bytes());
        buf[48..56].copy_from_slice(&self.max_seq.to_le_bytes());
        let crc = Checksum::compute(&buf[0..56]);
        buf[56..60].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_SIZE {
            return Err(StorageError::Corruption("short sstable footer".into()));
        }
        Checksum::verify(&buf[0..56], read_u32(buf, 56))?;
        if read_u32(buf, 0) != SSTABLE_MAGIC {
            return Err(StorageError::Corruption("bad sstable magic".into()));
        }
        let version = read_u32(buf, 4);
        if version != SSTABLE_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported sstable version {}",
                version
            )));
        }
        Ok(Self {
            index_offset: read_u64(buf, 8),
            index_size: read_u32(buf, 16),
            index_crc: read_u32(buf, 20),
            bloom_offset: read_u64(buf, 24),
            bloom_size: read_u32(buf, 32),
            bloom_crc: read_u32(buf, 36),
            num_entries: read_u64(buf, 40),
            max_seq: read_u64(buf, 48),
        })
    }
}

/// SSTable (read-only)
pub struct SSTable {
    path: PathBuf,
    file: Mutex<File>,
    index: BlockIndex,
    bloom: BloomFilter,
    meta: TableMeta,
    obsolete: AtomicBool,
}

impl SSTable {
    /// Open a table, verifying footer, index and bloom
    pub fn open(path: &Path, id: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(StorageError::Corruption(format!(
                "sstable {} is {} bytes, smaller than its footer",
                path.display(),
                file_size
            )));
        }

        let footer_buf = read_at(&mut file, file_size - FOOTER_SIZE as u64, FOOTER_SIZE)?;
        let footer = Footer::deserialize(&footer_buf)?;

        let index_end = footer.index_offset + u64::from(footer.index_size);
        let bloom_end = footer.bloom_offset + u64::from(footer.bloom_size);
        if index_end > file_size || bloom_end > file_size {
            return Err(StorageError::Corruption(format!(
                "sstable {} footer points past end of file",
                path.display()
            )));
        }

        let index_buf = read_at(&mut file, footer.index_offset, footer.index_size as usize)?;
        Checksum::verify(&index_buf, footer.index_crc)?;
        let index = BlockIndex::deserialize(&index_buf)?;

        let bloom_buf = read_at(&mut file, footer.bloom_offset, footer.bloom_size as usize)?;
        Checksum::verify(&bloom_buf, footer.bloom_crc)?;
        let bloom = BloomFilter::from_bytes(&bloom_buf)
            .ok_or_else(|| StorageError::Corruption("malformed bloom filter".into()))?;

        let meta = TableMeta {
            id,
            size: file_size,
            num_entries: footer.num_entries,
            smallest: index.smallest.clone(),
            largest: index.largest.clone(),
            max_seq: footer.max_seq,
        };

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            index,
            bloom,
            meta,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Entry stored for `key` (tombstones included)
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        if !self.may_contain_key(key) {
            return Ok(None);
        }
        let Some(block_idx) = self.index.find_block(key) else {
            return Ok(None);
        };
        let entries = self.read_block(block_idx)?;
        Ok(entries
            .binary_search_by(|e| e.key.as_slice().cmp(key))
            .ok()
            .map(|pos| entries[pos].clone()))
    }

    /// Key-range and bloom check without touching data blocks
    pub fn may_contain_key(&self, key: &[u8]) -> bool {
        self.overlaps(key, key) && self.bloom.may_contain_hash(hash(key))
    }

    /// Does `[start, end]` intersect the table's key range?
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.meta.smallest.as_slice() <= end && start <= self.meta.largest.as_slice()
    }

    /// Stream all entries in key order
    pub fn iter(self: &Arc<Self>) -> SSTableIterator {
        SSTableIterator::new(Arc::clone(self), 0, None)
    }

    /// Stream entries with key `>= key`
    pub fn seek(self: &Arc<Self>, key: &[u8]) -> SSTableIterator {
        let start = self.index.find_block(key).unwrap_or(0);
        SSTableIterator::new(Arc::clone(self), start, Some(key.to_vec()))
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file once the last handle is dropped
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    fn read_block(&self, idx: usize) -> Result<Vec<Entry>> {
        let handle = &self.index.blocks[idx];
        let raw = {
            let mut file = self.file.lock();
            read_at(&mut file, handle.offset, handle.size as usize)?
        };
        Checksum::verify(&raw, handle.crc).map_err(|e| {
            StorageError::Corruption(format!(
                "block {} of {}: {}",
                idx,
                self.path.display(),
                e
            ))
        })?;
        decode_block(&raw)
    }
}

impl Drop for SSTable {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(table = self.meta.id, "Removed obsolete sstable"),
                Err(e) => warn!(table = self.meta.id, error = %e, "Failed to remove obsolete sstable"),
            }
        }
    }
}

/// Writes a new SSTable from entries supplied in strictly ascending key order
pub struct SSTableBuilder {
    writer: BufWriter<File>,
    path: PathBuf,
    id: u64,
    block_size: usize,
    false_positive: f64,
    enable_compression: bool,

    current_block: Vec<u8>,
    current_count: u32,
    current_first_key: Vec<u8>,

    index: BlockIndex,
    key_hashes: Vec<u32>,
    last_key: Option<Vec<u8>>,
    num_entries: u64,
    max_seq: u64,
    offset: u64,
}

impl SSTableBuilder {
    pub fn new(path: &Path, id: u64, opts: &Options) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::with_capacity(64 * 1024, file),
            path: path.to_path_buf(),
            id,
            block_size: opts.block_size,
            false_positive: opts.bloom_false_positive,
            enable_compression: opts.enable_compression,
            current_block: Vec::new(),
            current_count: 0,
            current_first_key: Vec::new(),
            index: BlockIndex::default(),
            key_hashes: Vec::new(),
            last_key: None,
            num_entries: 0,
            max_seq: 0,
            offset: 0,
        })
    }

    pub fn add(&mut self, entry: &Entry) -> Result<()> {
        if let Some(last) = &self.last_key {
            if entry.key.as_slice() <= last.as_slice() {
                return Err(StorageError::InvalidArgument(
                    "sstable keys must be strictly ascending".into(),
                ));
            }
        }

        if self.num_entries == 0 {
            self.index.smallest = entry.key.clone();
        }
        if self.current_count == 0 {
            self.current_first_key = entry.key.clone();
        }
        entry.encode_into(&mut self.current_block);
        self.current_count += 1;

        self.key_hashes.push(hash(&entry.key));
        self.num_entries += 1;
        self.max_seq = self.max_seq.max(entry.seq);
        self.last_key = Some(entry.key.clone());

        if self.current_block.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Bytes written so far plus the pending block
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.current_block.len() as u64
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Write index, bloom and footer, then sync the file
    pub fn finish(mut self) -> Result<TableMeta> {
        if self.num_entries == 0 {
            return Err(StorageError::InvalidArgument("cannot finish an empty sstable".into()));
        }
        self.flush_block()?;
        self.index.largest = self.last_key.take().unwrap_or_default();

        let index_data = self.index.serialize();
        let index_offset = self.offset;
        self.writer.write_all(&index_data)?;
        self.offset += index_data.len() as u64;

        let bloom_data = BloomFilter::from_hashes(&self.key_hashes, self.false_positive).to_bytes();
        let bloom_offset = self.offset;
        self.writer.write_all(&bloom_data)?;
        self.offset += bloom_data.len() as u64;

        let footer = Footer {
            index_offset,
            index_size: index_data.len() as u32,
            index_crc: Checksum::compute(&index_data),
            bloom_offset,
            bloom_size: bloom_data.len() as u32,
            bloom_crc: Checksum::compute(&bloom_data),
            num_entries: self.num_entries,
            max_seq: self.max_seq,
        };
        self.writer.write_all(&footer.serialize())?;
        self.offset += FOOTER_SIZE as u64;

        self.writer.flush()?;
        self.writer.get_mut().sync_all()?;

        Ok(TableMeta {
            id: self.id,
            size: self.offset,
            num_entries: self.num_entries,
            smallest: std::mem::take(&mut self.index.smallest),
            largest: std::mem::take(&mut self.index.largest),
            max_seq: self.max_seq,
        })
    }

    /// Drop a partially written table
    pub fn abandon(self) {
        let path = self.path.clone();
        drop(self);
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove abandoned sstable");
        }
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.current_count == 0 {
            return Ok(());
        }
        let mut body = Vec::with_capacity(4 + self.current_block.len());
        body.extend_from_slice(&self.current_count.to_le_bytes());
        body.append(&mut self.current_block);

        let block = encode_block(body, self.enable_compression)?;
        self.index.blocks.push(BlockHandle {
            first_key: std::mem::take(&mut self.current_first_key),
            offset: self.offset,
            size: block.len() as u32,
            crc: Checksum::compute(&block),
        });
        self.writer.write_all(&block)?;
        self.offset += block.len() as u64;
        self.current_count = 0;
        Ok(())
    }
}

fn encode_block(body: Vec<u8>, enable_compression: bool) -> Result<Vec<u8>> {
    if enable_compression && body.len() >= MIN_COMPRESS_SIZE {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&body)
            .map_err(|e| StorageError::Serialization(format!("snappy compression failed: {}", e)))?;
        if compressed.len() < body.len() {
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(BLOCK_SNAPPY);
            out.extend_from_slice(&compressed);
            return Ok(out);
        }
    }
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(BLOCK_RAW);
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_block(raw: &[u8]) -> Result<Vec<Entry>> {
    let (&flag, rest) = raw
        .split_first()
        .ok_or_else(|| StorageError::Corruption("empty data block".into()))?;
    let decompressed;
    let body: &[u8] = match flag {
        BLOCK_RAW => rest,
        BLOCK_SNAPPY => {
            decompressed = snap::raw::Decoder::new()
                .decompress_vec(rest)
                .map_err(|e| StorageError::Corruption(format!("snappy: {}", e)))?;
            &decompressed
        }
        other => {
            return Err(StorageError::Corruption(format!(
                "unknown block flag {}",
                other
            )))
        }
    };

    if body.len() < 4 {
        return Err(StorageError::Corruption("data block without count".into()));
    }
    let count = read_u32(body, 0) as usize;
    let mut entries = Vec::with_capacity(count.min(body.len()));
    let mut pos = 4;
    for _ in 0..count {
        let (entry, used) = Entry::decode_prefix(&body[pos..])?;
        entries.push(entry);
        pos += used;
    }
    Ok(entries)
}

/// Streaming iterator: loads one block at a time
pub struct SSTableIterator {
    table: Arc<SSTable>,
    next_block: usize,
    entries: std::vec::IntoIter<Entry>,
    /// Skip entries below this key (first block only)
    lower_bound: Option<Vec<u8>>,
    done: bool,
}

impl SSTableIterator {
    fn new(table: Arc<SSTable>, start_block: usize, lower_bound: Option<Vec<u8>>) -> Self {
        Self {
            table,
            next_block: start_block,
            entries: Vec::new().into_iter(),
            lower_bound,
            done: false,
        }
    }
}

impl Iterator for SSTableIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(entry) = self.entries.next() {
                if let Some(bound) = &self.lower_bound {
                    if entry.key.as_slice() < bound.as_slice() {
                        continue;
                    }
                    self.lower_bound = None;
                }
                return Some(Ok(entry));
            }
            if self.next_block >= self.table.index.blocks.len() {
                self.done = true;
                return None;
            }
            match self.table.read_block(self.next_block) {
                Ok(entries) => {
                    self.entries = entries.into_iter();
                    self.next_block += 1;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn read_at(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Bounds-checked reader over an index block
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| StorageError::Corruption("sstable index overrun".into()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        self.take(4).map(|b| read_u32(b, 0))
    }

    fn u64(&mut self) -> Result<u64> {
        self.take(8).map(|b| read_u64(b, 0))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build(dir: &Path, id: u64, opts: &Options, n: usize) -> (PathBuf, TableMeta) {
        let path = dir.join(table_file_name(id));
        let mut builder = SSTableBuilder::new(&path, id, opts).unwrap();
        for i in 0..n {
            let mut e = Entry::new(format!("key{:05}", i), format!("value{}", i).repeat(4));
            e.seq = i as u64 + 1;
            builder.add(&e).unwrap();
        }
        builder.add(&Entry::tombstone("zz-deleted")).unwrap();
        (path, builder.finish().unwrap())
    }

    fn small_blocks(dir: &Path) -> Options {
        let mut opts = Options::for_testing(dir);
        opts.block_size = 512;
        opts
    }

    #[test]
    fn test_sstable_basic() {
        let dir = TempDir::new().unwrap();
        let opts = small_blocks(dir.path());
        let (path, meta) = build(dir.path(), 1, &opts, 500);

        assert_eq!(meta.num_entries, 501);
        assert_eq!(meta.smallest, b"key00000");
        assert_eq!(meta.largest, b"zz-deleted");
        assert_eq!(meta.max_seq, 500);

        let table = SSTable::open(&path, 1).unwrap();
        assert_eq!(table.meta(), &meta);
        assert!(table.index.blocks.len() > 1);

        for i in [0, 1, 250, 499] {
            let got = table.get(format!("key{:05}", i).as_bytes()).unwrap().unwrap();
            assert_eq!(got.value.as_literal().unwrap(), format!("value{}", i).repeat(4).as_bytes());
        }
        assert!(table.get(b"key00500").unwrap().is_none());
        assert!(table.get(b"a").unwrap().is_none());
        assert!(table.get(b"zz-deleted").unwrap().unwrap().deleted);
    }

    #[test]
    fn test_iter_and_seek() {
        let dir = TempDir::new().unwrap();
        let opts = small_blocks(dir.path());
        let (path, _) = build(dir.path(), 2, &opts, 300);
        let table = Arc::new(SSTable::open(&path, 2).unwrap());

        let all: Vec<Entry> = table.iter().collect::<Result<_>>().unwrap();
        assert_eq!(all.len(), 301);
        assert!(all.windows(2).all(|w| w[0].key < w[1].key));

        let from: Vec<Entry> = table.seek(b"key00150").collect::<Result<_>>().unwrap();
        assert_eq!(from.first().unwrap().key, b"key00150");
        assert_eq!(from.len(), 151);
    }

    #[test]
    fn test_compressed_blocks_read_back() {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::for_testing(dir.path());
        opts.block_size = 8 * 1024;
        opts.enable_compression = false;
        let (_, plain) = build(dir.path(), 30, &opts, 2000);

        opts.enable_compression = true;
        let (path, meta) = build(dir.path(), 3, &opts, 2000);

        let table = SSTable::open(&path, 3).unwrap();
        assert!(meta.size < plain.size, "blocks should compress");
        assert!(table.get(b"key01999").unwrap().is_some());
    }

    #[test]
    fn test_unsorted_add_rejected() {
        let dir = TempDir::new().unwrap();
        let opts = Options::for_testing(dir.path());
        let mut builder = SSTableBuilder::new(&dir.path().join("x.sst"), 9, &opts).unwrap();
        builder.add(&Entry::new("b", "1")).unwrap();
        assert!(builder.add(&Entry::new("a", "1")).is_err());
        assert!(builder.add(&Entry::new("b", "2")).is_err());
    }

    #[test]
    fn test_corrupt_block_detected() {
        let dir = TempDir::new().unwrap();
        let opts = small_blocks(dir.path());
        let (path, _) = build(dir.path(), 4, &opts, 100);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let table = SSTable::open(&path, 4).unwrap();
        assert!(matches!(table.get(b"key00000"), Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_corrupt_footer_fails_open() {
        let dir = TempDir::new().unwrap();
        let opts = small_blocks(dir.path());
        let (path, _) = build(dir.path(), 5, &opts, 10);

        let mut bytes = std::fs::read(&path).unwrap();
        let at = bytes.len() - 20;
        bytes[at] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(SSTable::open(&path, 5).is_err());
    }

    #[test]
    fn test_obsolete_table_removed_on_last_drop() {
        let dir = TempDir::new().unwrap();
        let opts = small_blocks(dir.path());
        let (path, _) = build(dir.path(), 6, &opts, 10);

        let table = Arc::new(SSTable::open(&path, 6).unwrap());
        let reader = Arc::clone(&table);
        table.mark_obsolete();
        drop(table);
        assert!(path.exists());
        assert!(reader.get(b"key00003").unwrap().is_some());
        drop(reader);
        assert!(!path.exists());
    }
}
