//! Byte framing of log entries, used both for durable storage and for the
//! stream a leader sends to its followers.
//!
//! A command entry is a fixed 24-byte big-endian header followed by its
//! payload:
//!
//! ```text
//! +-----------+-----------+----------------+-------------------+
//! | term (8)  | index (8) | data length (8)| data (length)     |
//! +-----------+-----------+----------------+-------------------+
//! ```
//!
//! A snapshot boundary is the single byte `0xFF` in place of the header.
//! Because the decoder inspects the first header byte to tell the two apart,
//! a command whose term has `0xFF` as its most significant byte cannot be
//! framed.

use std::io::{self, Read, Write};

use urd_types::UrdError;

use crate::types::{EntryType, LogEntry};

pub const SNAPSHOT_MARKER: u8 = 0xFF;
pub const HEADER_LEN: usize = 24;
/// Largest payload the decoder accepts.
pub const MAX_DATA_LEN: u64 = 256 * 1024 * 1024;

fn io_err(e: io::Error) -> UrdError {
    UrdError::Storage(e.to_string())
}

/// Writes framed entries to `W`.
pub struct LogEntryEncoder<W> {
    w: W,
}

impl<W: Write> LogEntryEncoder<W> {
    pub fn new(w: W) -> Self {
        LogEntryEncoder { w }
    }

    pub fn encode(&mut self, entry: &LogEntry) -> Result<(), UrdError> {
        match entry.entry_type {
            EntryType::Snapshot => self.w.write_all(&[SNAPSHOT_MARKER]).map_err(io_err),
            EntryType::Command => {
                if (entry.term >> 56) as u8 == SNAPSHOT_MARKER {
                    return Err(UrdError::Framing(format!(
                        "term {} collides with the snapshot marker",
                        entry.term
                    )));
                }
                let mut header = [0u8; HEADER_LEN];
                header[0..8].copy_from_slice(&entry.term.to_be_bytes());
                header[8..16].copy_from_slice(&entry.index.to_be_bytes());
                header[16..24].copy_from_slice(&(entry.data.len() as u64).to_be_bytes());
                self.w.write_all(&header).map_err(io_err)?;
                self.w.write_all(&entry.data).map_err(io_err)
            }
        }
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

/// Reads framed entries from `R`.
///
/// Also an [`Iterator`]; iteration stops after the first error so a
/// corrupt stream is never skipped over.
pub struct LogEntryDecoder<R> {
    r: R,
    failed: bool,
}

impl<R: Read> LogEntryDecoder<R> {
    pub fn new(r: R) -> Self {
        LogEntryDecoder { r, failed: false }
    }

    /// Decodes the next entry. `Ok(None)` means the stream ended cleanly on
    /// an entry boundary; a partial header or short payload is a framing
    /// error.
    pub fn decode(&mut self) -> Result<Option<LogEntry>, UrdError> {
        let mut header = [0u8; HEADER_LEN];
        if !read_first_byte(&mut self.r, &mut header[0])? {
            return Ok(None);
        }
        if header[0] == SNAPSHOT_MARKER {
            return Ok(Some(LogEntry::snapshot_marker()));
        }

        self.r.read_exact(&mut header[1..]).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => UrdError::Framing("truncated entry header".into()),
            _ => io_err(e),
        })?;

        let term = u64::from_be_bytes(header[0..8].try_into().expect("8 byte slice"));
        let index = u64::from_be_bytes(header[8..16].try_into().expect("8 byte slice"));
        let len = u64::from_be_bytes(header[16..24].try_into().expect("8 byte slice"));
        if len > MAX_DATA_LEN {
            return Err(UrdError::Framing(format!(
                "entry {index} declares {len} data bytes, limit is {MAX_DATA_LEN}"
            )));
        }

        let mut data = vec![0u8; len as usize];
        self.r.read_exact(&mut data).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                UrdError::Framing(format!("entry {index} truncated: expected {len} data bytes"))
            }
            _ => io_err(e),
        })?;

        Ok(Some(LogEntry::command(term, index, data)))
    }

    pub fn into_inner(self) -> R {
        self.r
    }
}

impl<R: Read> Iterator for LogEntryDecoder<R> {
    type Item = Result<LogEntry, UrdError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.decode() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Returns `false` on a clean end of stream.
fn read_first_byte<R: Read>(r: &mut R, byte: &mut u8) -> Result<bool, UrdError> {
    let mut buf = [0u8; 1];
    loop {
        match r.read(&mut buf) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                *byte = buf[0];
                return Ok(true);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_err(e)),
        }
    }
}

/// Frames a single entry.
pub fn encode_entry(entry: &LogEntry) -> Result<Vec<u8>, UrdError> {
    let mut buf = Vec::with_capacity(HEADER_LEN + entry.data.len());
    LogEntryEncoder::new(&mut buf).encode(entry)?;
    Ok(buf)
}

/// Decodes exactly one entry; trailing bytes are a framing error.
pub fn decode_entry(bytes: &[u8]) -> Result<LogEntry, UrdError> {
    let mut dec = LogEntryDecoder::new(bytes);
    let entry = dec
        .decode()?
        .ok_or_else(|| UrdError::Framing("empty entry frame".into()))?;
    if !dec.into_inner().is_empty() {
        return Err(UrdError::Framing(format!("trailing bytes after entry {}", entry.index)));
    }
    Ok(entry)
}

/// Frames `entries` back to back into one buffer.
pub fn encode_entries<'a>(
    entries: impl IntoIterator<Item = &'a LogEntry>,
) -> Result<Vec<u8>, UrdError> {
    let mut enc = LogEntryEncoder::new(Vec::new());
    for entry in entries {
        enc.encode(entry)?;
    }
    Ok(enc.into_inner())
}

/// Decodes a whole buffer of back-to-back entries.
pub fn decode_entries(bytes: &[u8]) -> Result<Vec<LogEntry>, UrdError> {
    LogEntryDecoder::new(bytes).collect()
}
