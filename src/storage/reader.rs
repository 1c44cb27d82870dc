//! Reading the event log back.
//!
//! Only newline-terminated lines count as records. A trailing line without
//! its newline may be a write cut short by a crash, so it is discarded and the
//! offset stays in front of it; a later read resumes from there.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::record::LogRecord;
use crate::error::Result;

/// Records read in one pass
#[derive(Debug, Clone, Default)]
pub struct ReadBatch {
    pub records: Vec<LogRecord>,
    /// Byte offset just past the last complete line
    pub next_offset: u64,
    /// Complete lines that were not valid records
    pub skipped: usize,
    /// An incomplete trailing line was discarded
    pub truncated_tail: bool,
}

/// Incremental reader over a JSONL event log
#[derive(Debug, Clone)]
pub struct LogReader {
    path: PathBuf,
    offset: u64,
}

impl LogReader {
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self::at_offset(path, 0)
    }

    /// Resume reading from a byte offset returned by an earlier read
    pub fn at_offset(path: impl AsRef<Path>, offset: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            offset,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every complete record from the current offset to end of file
    pub fn read_available(&mut self) -> Result<ReadBatch> {
        let mut batch = ReadBatch {
            next_offset: self.offset,
            ..Default::default()
        };

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(batch),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.offset))?;

        let mut line = Vec::new();
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            if n == 0 {
                break;
            }
            if line.last() != Some(&b'\n') {
                batch.truncated_tail = !line.iter().all(u8::is_ascii_whitespace);
                break;
            }
            batch.next_offset += n as u64;

            let text = line.trim_ascii();
            if text.is_empty() {
                continue;
            }
            match serde_json::from_slice::<LogRecord>(text) {
                Ok(record) => batch.records.push(record),
                Err(e) => {
                    log::warn!(
                        "skipping malformed record in {} before offset {}: {}",
                        self.path.display(),
                        batch.next_offset,
                        e
                    );
                    batch.skipped += 1;
                }
            }
        }

        if batch.truncated_tail {
            log::debug!(
                "discarding incomplete trailing record in {} at offset {}",
                self.path.display(),
                batch.next_offset
            );
        }
        self.offset = batch.next_offset;
        Ok(batch)
    }
}

/// Read a whole log file
pub fn read_all(path: impl AsRef<Path>) -> Result<ReadBatch> {
    LogReader::open(path).read_available()
}
