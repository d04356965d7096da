//! Write-Ahead Log for one memtable
//!
//! Every entry is framed as a checksummed record
//! (see [`checksum`](crate::storage::checksum)) and synced before the write
//! is acknowledged.
//!
//! ## Recovery
//! - Records are replayed in file order; a later record for a key wins.
//! - A torn or checksum-failing tail ends replay. The file is truncated to
//!   the last good record so that appends after recovery stay reachable.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::storage::checksum::{encode_record, read_record, ChecksumError, RecordRead, RECORD_HEADER_SIZE};
use crate::storage::codec::Entry;
use crate::Result;

pub const WAL_EXTENSION: &str = "wal";

pub fn wal_file_name(id: u64) -> String {
    format!("{:05}.{}", id, WAL_EXTENSION)
}

/// Parse the id out of a `NNNNN.wal` path
pub fn parse_wal_id(path: &Path) -> Option<u64> {
    if path.extension()? != WAL_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Append-only log file backing a memtable
pub struct Wal {
    id: u64,
    path: PathBuf,
    file: File,
    /// Bytes of valid records
    size: u64,
    sync_writes: bool,
}

impl Wal {
    /// Create an empty WAL, replacing any file with the same id
    pub fn create(dir: &Path, id: u64, sync_writes: bool) -> Result<Self> {
        let path = dir.join(wal_file_name(id));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            id,
            path,
            file,
            size: 0,
            sync_writes,
        })
    }

    /// Open an existing WAL, returning it with every recovered entry
    pub fn open(path: &Path, sync_writes: bool) -> Result<(Self, Vec<Entry>)> {
        let id = parse_wal_id(path).unwrap_or(0);
        let file = OpenOptions::new().read(true).append(true).open(path)?;
        let file_len = file.metadata()?.len();

        let mut entries = Vec::new();
        let mut valid: u64 = 0;
        let mut reader = BufReader::new(file.try_clone()?);

        loop {
            let payload = match read_record(&mut reader) {
                Ok(RecordRead::Record(payload)) => payload,
                Ok(RecordRead::Eof) => break,
                Ok(RecordRead::Truncated) => {
                    warn!(path = %path.display(), offset = valid, "WAL ends with a torn record");
                    break;
                }
                Err(ChecksumError::Io(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(path = %path.display(), offset = valid, error = %e, "WAL tail failed verification");
                    break;
                }
            };
            match Entry::decode(&payload) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(path = %path.display(), offset = valid, error = %e, "WAL record does not decode");
                    break;
                }
            }
            valid += (RECORD_HEADER_SIZE + payload.len()) as u64;
        }

        if valid < file_len {
            debug!(path = %path.display(), from = file_len, to = valid, "Truncating WAL tail");
            file.set_len(valid)?;
            file.sync_all()?;
        }

        Ok((
            Self {
                id,
                path: path.to_path_buf(),
                file,
                size: valid,
                sync_writes,
            },
            entries,
        ))
    }

    /// Append one entry; durable on return when `sync_writes` is set
    pub fn write(&mut self, entry: &Entry) -> Result<()> {
        entry.check_size()?;
        let record = encode_record(&entry.encode());
        self.file.write_all(&record)?;
        if self.sync_writes {
            self.file.sync_data()?;
        }
        self.size += record.len() as u64;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = {
            let mut wal = Wal::create(dir.path(), 3, true).unwrap();
            wal.write(&Entry::new("a", "1")).unwrap();
            wal.write(&Entry::tombstone("b")).unwrap();
            wal.path().to_path_buf()
        };
        assert_eq!(parse_wal_id(&path), Some(3));

        let (wal, entries) = Wal::open(&path, true).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, b"a");
        assert!(entries[1].deleted);
        assert_eq!(wal.size(), std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_torn_tail_is_dropped_and_truncated() {
        let dir = TempDir::new().unwrap();
        let path = {
            let mut wal = Wal::create(dir.path(), 1, true).unwrap();
            wal.write(&Entry::new("kept", "v")).unwrap();
            wal.path().to_path_buf()
        };
        let good_len = std::fs::metadata(&path).unwrap().len();

        // Half of a second record, as left by a crash mid-append
        let torn = encode_record(&Entry::new("lost", "v").encode());
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&torn[..torn.len() / 2]).unwrap();
        drop(f);

        let (mut wal, entries) = Wal::open(&path, true).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        // Appends after recovery are visible to the next replay
        wal.write(&Entry::new("after", "v")).unwrap();
        drop(wal);
        let (_, entries) = Wal::open(&path, true).unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![b"kept".to_vec(), b"after".to_vec()]);
    }

    #[test]
    fn test_oversized_entry_never_reaches_the_log() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::create(dir.path(), 4, false).unwrap();
        let huge = Entry::new("huge", vec![0u8; crate::storage::checksum::MAX_RECORD_SIZE]);
        assert!(matches!(wal.write(&huge), Err(crate::StorageError::InvalidArgument(_))));
        assert_eq!(wal.size(), 0);

        wal.write(&Entry::new("small", "v")).unwrap();
        let path = wal.path().to_path_buf();
        drop(wal);
        let (_, entries) = Wal::open(&path, false).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_corrupt_record_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = {
            let mut wal = Wal::create(dir.path(), 2, true).unwrap();
            wal.write(&Entry::new("first", "v")).unwrap();
            wal.write(&Entry::new("second", "v")).unwrap();
            wal.path().to_path_buf()
        };
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let (_, entries) = Wal::open(&path, true).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"first");
    }
}
