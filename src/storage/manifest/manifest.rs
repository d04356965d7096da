//! Manifest file management and persistence
//!
//! ## Files
//! - `CURRENT`: name of the live manifest, replaced by atomic rename
//! - `MANIFEST-NNNNNN`: checksummed records (see
//!   [`checksum`](crate::storage::checksum)), each a bincode [`ManifestRecord`]
//!
//! ## Recovery
//! Records replay in order. A checksum failure on a complete record is fatal;
//! nothing after it can be trusted. An incomplete final record is a torn
//! append whose edit was never acknowledged, so it is cut off.
//!
//! ## Rewrite
//! Once the live file passes the rewrite threshold, the current version is
//! written as a single `Snapshot` record into the next manifest, `CURRENT` is
//! switched, and the old manifest is deleted.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::version::{Version, VersionEdit};
use crate::storage::checksum::{encode_record, read_record, ChecksumError, RecordRead, RECORD_HEADER_SIZE};
use crate::{Result, StorageError};

const CURRENT: &str = "CURRENT";

/// Manifest record types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ManifestRecord {
    /// Incremental change, applied atomically
    Edit(VersionEdit),
    /// Full level layout; replaces everything before it
    Snapshot(Version),
}

fn manifest_name(number: u64) -> String {
    format!("MANIFEST-{:06}", number)
}

/// Manifest manager. Callers serialize access (the level manager holds it
/// behind a mutex).
pub struct Manifest {
    dir: PathBuf,
    file: File,
    number: u64,
    /// Bytes in the live manifest
    size: u64,
    version: Version,
    rewrite_threshold: u64,
}

impl Manifest {
    /// Create or load the manifest in `dir`
    pub fn open(dir: &Path, num_levels: usize, rewrite_threshold: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let current_path = dir.join(CURRENT);

        if !current_path.exists() {
            let version = Version::new(num_levels);
            let (file, size) = Self::write_snapshot(dir, 1, &version)?;
            Self::set_current(dir, 1)?;
            return Ok(Self {
                dir: dir.to_path_buf(),
                file,
                number: 1,
                size,
                version,
                rewrite_threshold,
            });
        }

        let name = fs::read_to_string(&current_path)?;
        let name = name.trim();
        let number = name
            .strip_prefix("MANIFEST-")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| StorageError::Corruption(format!("CURRENT names '{}'", name)))?;

        let path = dir.join(name);
        let (mut version, size) = Self::replay(&path)?;
        if version.levels.len() < num_levels {
            version.levels.resize(num_levels, Vec::new());
        }
        let file = OpenOptions::new().append(true).open(&path)?;

        info!(
            manifest = name,
            tables = version.table_count(),
            "Recovered manifest"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            number,
            size,
            version,
            rewrite_threshold,
        })
    }

    /// Rebuild the version from a manifest file
    fn replay(path: &Path) -> Result<(Version, u64)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file.try_clone()?);

        let mut version = Version::default();
        let mut valid: u64 = 0;
        loop {
            let payload = match read_record(&mut reader) {
                Ok(RecordRead::Record(payload)) => payload,
                Ok(RecordRead::Eof) => break,
                Ok(RecordRead::Truncated) => {
                    warn!(path = %path.display(), offset = valid, "Manifest ends with a torn record");
                    break;
                }
                Err(ChecksumError::Io(e)) => return Err(e.into()),
                Err(e) => {
                    return Err(StorageError::Corruption(format!(
                        "manifest {} at offset {}: {}",
                        path.display(),
                        valid,
                        e
                    )))
                }
            };
            let record: ManifestRecord = bincode::deserialize(&payload).map_err(|e| {
                StorageError::Corruption(format!("manifest record at offset {}: {}", valid, e))
            })?;
            match record {
                ManifestRecord::Edit(edit) => version.apply(&edit),
                ManifestRecord::Snapshot(snapshot) => version = snapshot,
            }
            valid += (RECORD_HEADER_SIZE + payload.len()) as u64;
        }

        if valid < file_len {
            file.set_len(valid)?;
            file.sync_all()?;
        }
        Ok((version, valid))
    }

    /// Append an edit durably, then apply it to the in-memory version
    pub fn apply(&mut self, edit: &VersionEdit) -> Result<()> {
        if edit.is_empty() {
            return Ok(());
        }
        let record = encode_record(&bincode::serialize(&ManifestRecord::Edit(edit.clone()))?);
        self.file.write_all(&record)?;
        self.file.sync_data()?;
        self.size += record.len() as u64;
        self.version.apply(edit);

        if self.size > self.rewrite_threshold {
            if let Err(e) = self.rewrite() {
                // The edit is already durable in the old manifest
                warn!(error = %e, "Manifest rewrite failed; keeping current file");
            }
        }
        Ok(())
    }

    /// Compact the manifest into a single snapshot record
    pub fn rewrite(&mut self) -> Result<()> {
        let next = self.number + 1;
        let (file, size) = Self::write_snapshot(&self.dir, next, &self.version)?;
        Self::set_current(&self.dir, next)?;

        let old = self.dir.join(manifest_name(self.number));
        self.file = file;
        self.number = next;
        self.size = size;
        if let Err(e) = fs::remove_file(&old) {
            warn!(path = %old.display(), error = %e, "Failed to remove old manifest");
        }
        info!(manifest = next, bytes = size, "Rewrote manifest");
        Ok(())
    }

    fn write_snapshot(dir: &Path, number: u64, version: &Version) -> Result<(File, u64)> {
        let path = dir.join(manifest_name(number));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let record = encode_record(&bincode::serialize(&ManifestRecord::Snapshot(version.clone()))?);
        file.write_all(&record)?;
        file.sync_all()?;
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok((file, record.len() as u64))
    }

    /// Point CURRENT at `number` by writing a temp file and renaming it over
    fn set_current(dir: &Path, number: u64) -> Result<()> {
        let tmp = dir.join(format!("{}.tmp", CURRENT));
        {
            let mut f = File::create(&tmp)?;
            writeln!(f, "{}", manifest_name(number))?;
            f.sync_all()?;
        }
        fs::rename(&tmp, dir.join(CURRENT))?;
        sync_dir(dir)
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Reserve a table id
    pub fn allocate_table_id(&mut self) -> u64 {
        let id = self.version.next_table_id;
        self.version.next_table_id += 1;
        id
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::manifest::TableMeta;
    use tempfile::TempDir;

    fn meta(id: u64) -> TableMeta {
        TableMeta {
            id,
            size: 4096,
            num_entries: 10,
            smallest: format!("a{}", id).into_bytes(),
            largest: format!("z{}", id).into_bytes(),
            max_seq: id,
        }
    }

    fn add(level: usize, id: u64) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.add_table(level, meta(id));
        edit
    }

    #[test]
    fn test_edits_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut manifest = Manifest::open(dir.path(), 7, 1 << 20).unwrap();
            manifest.apply(&add(0, 1)).unwrap();
            manifest.apply(&add(0, 2)).unwrap();

            let mut compaction = VersionEdit::new();
            compaction.remove_table(0, 1);
            compaction.remove_table(0, 2);
            compaction.add_table(1, meta(3));
            manifest.apply(&compaction).unwrap();
        }

        let manifest = Manifest::open(dir.path(), 7, 1 << 20).unwrap();
        let version = manifest.version();
        assert!(version.levels[0].is_empty());
        assert_eq!(version.levels[1], vec![meta(3)]);
        assert_eq!(version.next_table_id, 4);
        assert_eq!(version.levels.len(), 7);
    }

    #[test]
    fn test_rewrite_compacts_to_snapshot() {
        let dir = TempDir::new().unwrap();
        {
            let mut manifest = Manifest::open(dir.path(), 4, 512).unwrap();
            for id in 1..=20 {
                manifest.apply(&add(0, id)).unwrap();
                let mut edit = VersionEdit::new();
                edit.remove_table(0, id);
                manifest.apply(&edit).unwrap();
            }
            manifest.apply(&add(2, 99)).unwrap();
            assert!(manifest.number > 1);
            assert!(manifest.size() <= 512 + 256);
        }

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("MANIFEST-"))
            .collect();
        assert_eq!(names.len(), 1, "old manifests are deleted");

        let manifest = Manifest::open(dir.path(), 4, 512).unwrap();
        assert_eq!(manifest.version().table_count(), 1);
        assert_eq!(manifest.version().levels[2][0].id, 99);
        assert_eq!(manifest.version().next_table_id, 100);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        {
            let mut manifest = Manifest::open(dir.path(), 7, 1 << 20).unwrap();
            manifest.apply(&add(0, 1)).unwrap();
        }
        let path = dir.path().join(manifest_name(1));
        let torn = encode_record(&bincode::serialize(&ManifestRecord::Edit(add(0, 2))).unwrap());
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&torn[..torn.len() - 4]).unwrap();
        drop(f);

        let manifest = Manifest::open(dir.path(), 7, 1 << 20).unwrap();
        assert_eq!(manifest.version().table_count(), 1);
    }

    #[test]
    fn test_corrupt_record_is_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let mut manifest = Manifest::open(dir.path(), 7, 1 << 20).unwrap();
            manifest.apply(&add(0, 1)).unwrap();
        }
        let path = dir.path().join(manifest_name(1));
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            Manifest::open(dir.path(), 7, 1 << 20),
            Err(StorageError::Corruption(_))
        ));
    }
}
