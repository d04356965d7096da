//! Checksum and record framing
//!
//! Every append-only file in the store (WAL, value log, manifest) is a
//! sequence of framed records, and SSTable blocks carry the same CRC32.
//!
//! ## Record Format
//! ```text
//! [payload_len: u32 LE][crc32(payload): u32 LE][payload: payload_len bytes]
//! ```
//!
//! A reader distinguishes three ways a file can end:
//! - clean end of file on a record boundary ([`RecordRead::Eof`])
//! - a record cut short by a crash mid-append ([`RecordRead::Truncated`])
//! - a complete record whose checksum does not match ([`ChecksumError::Mismatch`])

use crc32fast::Hasher;
use std::io::{self, Read};

/// Size of the `{len, crc}` record header
pub const RECORD_HEADER_SIZE: usize = 8;

/// Upper bound on a single record payload. A larger length field can only
/// come from a damaged header.
pub const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// CRC32 helpers
pub struct Checksum;

impl Checksum {
    pub fn compute(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn verify(data: &[u8], expected: u32) -> Result<(), ChecksumError> {
        let actual = Self::compute(data);
        if actual != expected {
            return Err(ChecksumError::Mismatch {
                expected,
                actual,
                data_len: data.len(),
            });
        }
        Ok(())
    }
}

/// Frame a payload as one record
pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&Checksum::compute(payload).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decode a record held entirely in `buf` (exactly one frame)
pub fn decode_record(buf: &[u8]) -> Result<&[u8], ChecksumError> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err(ChecksumError::InvalidFormat(format!(
            "record too short: {} bytes",
            buf.len()
        )));
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if buf.len() != RECORD_HEADER_SIZE + len {
        return Err(ChecksumError::InvalidFormat(format!(
            "expected {} bytes, got {}",
            RECORD_HEADER_SIZE + len,
            buf.len()
        )));
    }
    let payload = &buf[RECORD_HEADER_SIZE..];
    Checksum::verify(payload, crc)?;
    Ok(payload)
}

/// Outcome of reading the next record from a stream
#[derive(Debug, PartialEq, Eq)]
pub enum RecordRead {
    /// A complete record with a valid checksum
    Record(Vec<u8>),
    /// End of stream on a record boundary
    Eof,
    /// The stream ends inside a record
    Truncated,
}

/// Read the next framed record from `reader`
pub fn read_record<R: Read>(reader: &mut R) -> Result<RecordRead, ChecksumError> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    let filled = read_full(reader, &mut header)?;
    if filled == 0 {
        return Ok(RecordRead::Eof);
    }
    if filled < RECORD_HEADER_SIZE {
        return Ok(RecordRead::Truncated);
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_RECORD_SIZE {
        return Err(ChecksumError::InvalidFormat(format!(
            "record length {} exceeds limit",
            len
        )));
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? < len {
        return Ok(RecordRead::Truncated);
    }
    Checksum::verify(&payload, crc)?;
    Ok(RecordRead::Record(payload))
}

/// Like `read_exact`, but reports how many bytes were read before EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x} (data_len={data_len})")]
    Mismatch {
        expected: u32,
        actual: u32,
        data_len: usize,
    },

    #[error("Invalid record format: {0}")]
    InvalidFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
