//! Value log: out-of-line storage for large values
//!
//! ## Design (WiscKey-style key/value separation)
//! - Values above `value_threshold` are appended here; the LSM stores a
//!   16-byte [`ValuePtr`] instead, which keeps compaction cheap.
//! - The value-log append is durable before the index write that points at
//!   it. If the index write then fails, the record is garbage for GC.
//! - Files are append-only; only the head file is written.
//!
//! ## File Format
//! ```text
//! [magic: u32][version: u32] [record 1] [record 2] ...
//! record = [len: u32][crc32: u32][encoded entry]
//! ```
//! Records carry the key so GC can check them against the index.
//!
//! ## Reclaiming files
//! A file emptied by GC leaves the file set at once, but is only deleted
//! when no [`ReadPin`] is outstanding. Readers pin before looking up a
//! pointer, so any pointer they hold stays readable.
//!
//! Discard statistics live in memory. [`ValueLog::rebuild_discards`]
//! recomputes them from the index at open.

mod gc;

pub use gc::{GcStats, ValueIndex};

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::storage::checksum::{decode_record, encode_record, read_record, ChecksumError, RecordRead, RECORD_HEADER_SIZE};
use crate::storage::codec::{read_u32, Entry, ValueData, ValuePtr};
use crate::{Result, StorageError};

const VLOG_MAGIC: u32 = 0x564C_4F47; // "VLOG"
const VLOG_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 8;

pub const VLOG_EXTENSION: &str = "vlog";

fn vlog_file_name(fid: u32) -> String {
    format!("{:06}.{}", fid, VLOG_EXTENSION)
}

fn parse_vlog_id(path: &Path) -> Option<u32> {
    if path.extension()? != VLOG_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// How a sequential scan of a value-log file ended
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ScanEnd {
    Clean,
    /// Incomplete or unverifiable tail starting at the returned offset
    Damaged(String),
}

/// The file currently being appended to
struct HeadFile {
    fid: u32,
    writer: BufWriter<File>,
    offset: u64,
}

impl HeadFile {
    fn create(dir: &Path, fid: u32) -> Result<Self> {
        let path = dir.join(vlog_file_name(fid));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&VLOG_MAGIC.to_le_bytes())?;
        file.write_all(&VLOG_VERSION.to_le_bytes())?;
        file.sync_all()?;
        Ok(Self {
            fid,
            writer: BufWriter::with_capacity(64 * 1024, file),
            offset: HEADER_SIZE,
        })
    }

    /// Reopen an existing head, cutting off any torn tail
    fn reopen(dir: &Path, fid: u32) -> Result<Self> {
        let path = dir.join(vlog_file_name(fid));
        let (valid, end) = scan_file(&path, |_, _| Ok(()))?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if let ScanEnd::Damaged(reason) = end {
            warn!(fid, offset = valid, reason = %reason, "Truncating value log tail");
            file.set_len(valid)?;
            file.sync_all()?;
        }
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        writer.seek(SeekFrom::Start(valid))?;
        Ok(Self {
            fid,
            writer,
            offset: valid,
        })
    }

    fn append(&mut self, record: &[u8], sync: bool) -> Result<ValuePtr> {
        let offset = self.offset;
        self.writer.write_all(record)?;
        self.writer.flush()?;
        if sync {
            self.writer.get_mut().sync_data()?;
        }
        self.offset += record.len() as u64;
        Ok(ValuePtr {
            fid: self.fid,
            offset,
            len: record.len() as u32,
        })
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_mut().sync_data()?;
        Ok(())
    }
}

/// Readers in flight, and the files GC emptied while they ran
#[derive(Default)]
struct ReadEpoch {
    active: usize,
    doomed: Vec<u32>,
}

/// Keeps every value-log file on disk while held
pub struct ReadPin {
    vlog: Arc<ValueLog>,
}

impl ReadPin {
    pub fn vlog(&self) -> &ValueLog {
        &self.vlog
    }
}

impl Drop for ReadPin {
    fn drop(&mut self) {
        self.vlog.unpin();
    }
}

/// Value log manager
pub struct ValueLog {
    dir: PathBuf,
    opts: Arc<Options>,
    head: Mutex<HeadFile>,
    /// Every file on disk, head included
    files: Mutex<BTreeSet<u32>>,
    readers: Mutex<LruCache<u32, Arc<Mutex<File>>>>,
    /// Bytes per file known to be unreferenced
    discard: Mutex<AHashMap<u32, u64>>,
    reads: Mutex<ReadEpoch>,
    gc_lock: Mutex<()>,
    closed: AtomicBool,
}

impl ValueLog {
    pub fn open(opts: Arc<Options>) -> Result<Self> {
        let dir = opts.vlog_dir();
        std::fs::create_dir_all(&dir)?;

        let mut files = BTreeSet::new();
        for dirent in std::fs::read_dir(&dir)? {
            if let Some(fid) = parse_vlog_id(&dirent?.path()) {
                files.insert(fid);
            }
        }

        let head = match files.iter().next_back().copied() {
            Some(fid) => HeadFile::reopen(&dir, fid)?,
            None => {
                files.insert(1);
                HeadFile::create(&dir, 1)?
            }
        };
        debug!(head = head.fid, files = files.len(), "Opened value log");

        let capacity = NonZeroUsize::new(opts.vlog_handle_cache).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            dir,
            head: Mutex::new(head),
            files: Mutex::new(files),
            readers: Mutex::new(LruCache::new(capacity)),
            discard: Mutex::new(AHashMap::new()),
            reads: Mutex::new(ReadEpoch::default()),
            gc_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            opts,
        })
    }

    /// Append a literal entry, returning where it landed
    pub fn write(&self, entry: &Entry) -> Result<ValuePtr> {
        self.check_open()?;
        if !matches!(entry.value, ValueData::Literal(_)) {
            return Err(StorageError::InvalidArgument(
                "value log stores literal values only".into(),
            ));
        }
        entry.check_size()?;
        let record = encode_record(&entry.encode());

        let mut head = self.head.lock();
        if head.offset > HEADER_SIZE && head.offset + record.len() as u64 > self.opts.vlog_file_size {
            self.rotate(&mut head)?;
        }
        head.append(&record, self.opts.sync_writes)
    }

    fn rotate(&self, head: &mut HeadFile) -> Result<()> {
        head.sync()?;
        let next = head.fid + 1;
        *head = HeadFile::create(&self.dir, next)?;
        self.files.lock().insert(next);
        debug!(fid = next, "Rotated value log");
        Ok(())
    }

    /// Read and verify the entry `ptr` points at
    pub fn read(&self, ptr: &ValuePtr) -> Result<Entry> {
        self.check_open()?;
        let handle = self.reader(ptr.fid)?;
        let mut buf = vec![0u8; ptr.len as usize];
        {
            let mut file = handle.lock();
            file.seek(SeekFrom::Start(ptr.offset))?;
            file.read_exact(&mut buf)?;
        }
        let payload = decode_record(&buf).map_err(|e| {
            StorageError::Corruption(format!(
                "value log {} offset {}: {}",
                ptr.fid, ptr.offset, e
            ))
        })?;
        Entry::decode(payload)
    }

    fn reader(&self, fid: u32) -> Result<Arc<Mutex<File>>> {
        let mut readers = self.readers.lock();
        if let Some(handle) = readers.get(&fid) {
            return Ok(Arc::clone(handle));
        }
        let file = File::open(self.dir.join(vlog_file_name(fid)))?;
        let handle = Arc::new(Mutex::new(file));
        readers.put(fid, Arc::clone(&handle));
        Ok(handle)
    }

    /// Record pointers that no longer back any live entry. Pointers into
    /// files already collected are ignored.
    pub fn add_discards(&self, ptrs: &[ValuePtr]) {
        let files = self.files.lock();
        let mut discard = self.discard.lock();
        for ptr in ptrs {
            if files.contains(&ptr.fid) {
                *discard.entry(ptr.fid).or_insert(0) += u64::from(ptr.len);
            }
        }
    }

    /// Recompute discard statistics from the newest index entries.
    ///
    /// Every byte of a file not referenced by a live entry counts as
    /// discarded. That covers garbage from before a restart and records
    /// whose index write never happened.
    pub fn rebuild_discards<I>(&self, index_entries: I) -> Result<()>
    where
        I: IntoIterator<Item = Result<Entry>>,
    {
        let mut live: AHashMap<u32, u64> = AHashMap::new();
        for item in index_entries {
            let entry = item?;
            if entry.is_dead() {
                continue;
            }
            if let Some(ptr) = entry.value.as_pointer() {
                *live.entry(ptr.fid).or_insert(0) += u64::from(ptr.len);
            }
        }

        let mut rebuilt = AHashMap::new();
        for fid in self.file_ids() {
            let size = std::fs::metadata(self.file_path(fid))?
                .len()
                .saturating_sub(HEADER_SIZE);
            let garbage = size.saturating_sub(live.get(&fid).copied().unwrap_or(0));
            if garbage > 0 {
                rebuilt.insert(fid, garbage);
            }
        }
        debug!(files = rebuilt.len(), "Rebuilt value log discard stats");
        *self.discard.lock() = rebuilt;
        Ok(())
    }

    pub fn discarded_bytes(&self, fid: u32) -> u64 {
        self.discard.lock().get(&fid).copied().unwrap_or(0)
    }

    pub fn head_fid(&self) -> u32 {
        self.head.lock().fid
    }

    pub fn file_ids(&self) -> Vec<u32> {
        self.files.lock().iter().copied().collect()
    }

    fn file_path(&self, fid: u32) -> PathBuf {
        self.dir.join(vlog_file_name(fid))
    }

    /// Pin every file until the returned guard drops. Pointers read from
    /// the index after pinning stay readable even if GC moves their records.
    pub fn pin(self: &Arc<Self>) -> ReadPin {
        self.reads.lock().active += 1;
        ReadPin {
            vlog: Arc::clone(self),
        }
    }

    fn unpin(&self) {
        let doomed = {
            let mut reads = self.reads.lock();
            reads.active -= 1;
            if reads.active == 0 {
                std::mem::take(&mut reads.doomed)
            } else {
                Vec::new()
            }
        };
        for fid in doomed {
            if let Err(e) = self.delete_file(fid) {
                warn!(fid, error = %e, "Failed to remove value log file");
            }
        }
    }

    /// Forget a file that GC has emptied. It is deleted now, or when the
    /// last reader pinned before this call lets go.
    fn remove_file(&self, fid: u32) -> Result<()> {
        self.files.lock().remove(&fid);
        self.discard.lock().remove(&fid);
        {
            let mut reads = self.reads.lock();
            if reads.active > 0 {
                debug!(fid, readers = reads.active, "Deferring value log removal");
                reads.doomed.push(fid);
                return Ok(());
            }
        }
        self.delete_file(fid)
    }

    fn delete_file(&self, fid: u32) -> Result<()> {
        self.readers.lock().pop(&fid);
        std::fs::remove_file(self.file_path(fid))?;
        info!(fid, "Removed value log file");
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.head.lock().sync()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.readers.lock().clear();
        self.head.lock().sync()
    }
}

/// Walk every record of a value-log file. Returns the offset just past the
/// last good record and how the walk ended.
pub(crate) fn scan_file<F>(path: &Path, mut visit: F) -> Result<(u64, ScanEnd)>
where
    F: FnMut(ValuePtr, Entry) -> Result<()>,
{
    let fid = parse_vlog_id(path).unwrap_or(0);
    let mut reader = BufReader::new(File::open(path)?);

    let mut header = [0u8; HEADER_SIZE as usize];
    if let Err(e) = reader.read_exact(&mut header) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(StorageError::Corruption(format!(
                "value log {} has no header",
                path.display()
            )));
        }
        return Err(e.into());
    }
    if read_u32(&header, 0) != VLOG_MAGIC {
        return Err(StorageError::Corruption(format!(
            "value log {} has bad magic",
            path.display()
        )));
    }

    let mut offset = HEADER_SIZE;
    loop {
        let payload = match read_record(&mut reader) {
            Ok(RecordRead::Record(payload)) => payload,
            Ok(RecordRead::Eof) => return Ok((offset, ScanEnd::Clean)),
            Ok(RecordRead::Truncated) => {
                return Ok((offset, ScanEnd::Damaged("torn record".into())))
            }
            Err(ChecksumError::Io(e)) => return Err(e.into()),
            Err(e) => return Ok((offset, ScanEnd::Damaged(e.to_string()))),
        };
        let len = (RECORD_HEADER_SIZE + payload.len()) as u32;
        let entry = match Entry::decode(&payload) {
            Ok(entry) => entry,
            Err(e) => return Ok((offset, ScanEnd::Damaged(e.to_string()))),
        };
        visit(ValuePtr { fid, offset, len }, entry)?;
        offset += u64::from(len);
    }
}
