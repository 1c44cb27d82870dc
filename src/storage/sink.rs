//! Destinations for serialized log lines.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{ConduitError, Result};

use super::record::LogRecord;

/// Append-only destination for log lines.
///
/// Each line is a serialized record without its trailing newline.
pub trait LogSink: Send {
    /// Append a batch of lines in order
    fn write_batch(&mut self, lines: &[String]) -> Result<()>;

    /// Flush and release the destination. Later writes fail.
    fn close(&mut self) -> Result<()>;
}

/// JSONL file sink. Opens in append mode and never rewrites existing content.
///
/// A failed write is truncated back to where the batch began. If that is not
/// possible, or the file already ends in a fragment, the next batch starts on
/// a fresh line so the fragment cannot swallow it.
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    mid_line: bool,
}

fn ends_mid_line(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

impl FileSink {
    /// Open (or create) the file at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mid_line = ends_mid_line(&path)?;
        if mid_line {
            log::warn!("{} ends in an incomplete record", path.display());
        }
        Ok(Self {
            path,
            file: Some(file),
            mid_line,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn write_batch(&mut self, lines: &[String]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ConduitError::LogWrite(format!("sink closed: {}", self.path.display())))?;

        // One write call per batch
        let mut buf = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum::<usize>() + 1);
        if self.mid_line {
            buf.push('\n');
        }
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }

        let start = file.metadata()?.len();
        match file.write_all(buf.as_bytes()).and_then(|()| file.flush()) {
            Ok(()) => {
                self.mid_line = false;
                Ok(())
            }
            Err(e) => {
                if let Err(undo) = file.set_len(start) {
                    log::warn!("could not undo partial write to {}: {}", self.path.display(), undo);
                    self.mid_line = true;
                }
                Err(e.into())
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_data()?;
        }
        Ok(())
    }
}

/// In-memory sink. Clones share the same line buffer, so a host or test can
/// keep one clone for inspection.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
    failing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail as if the disk were unavailable
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Parse every captured line back into a record
    pub fn records(&self) -> Result<Vec<LogRecord>> {
        self.lines()
            .iter()
            .map(|line| serde_json::from_str(line).map_err(ConduitError::from))
            .collect()
    }
}

impl LogSink for MemorySink {
    fn write_batch(&mut self, lines: &[String]) -> Result<()> {
        if self.is_closed() {
            return Err(ConduitError::LogWrite("sink closed".to_string()));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConduitError::LogWrite("simulated write failure".to_string()));
        }
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(lines.iter().cloned());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
