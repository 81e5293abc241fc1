//! Write-Ahead Log (WAL) for ledger persistence.
//!
//! Donation and issue events are appended to a JSONL (JSON Lines) file
//! with file locking to ensure safe concurrent access. The log is the
//! durable form of the ledger; everything else is rebuilt from it.

use crate::{LedgerEvent, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Event sink trait for persisting ledger events
///
/// Implementations must be durable before returning `Ok`: the ledger only
/// applies an event in memory after the sink accepted it.
pub trait EventSink: Send + Sync {
    fn append(&self, event: &LedgerEvent) -> Result<()>;
}

/// JSONL-based event sink with file locking
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    /// Create a new JSONL sink for the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ensure the parent directory exists
    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl EventSink for JsonlSink {
    fn append(&self, event: &LedgerEvent) -> Result<()> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        file.lock_exclusive()?;

        // Serialise first so a JSON failure never leaves a partial line
        let line = serde_json::to_string(event)?;
        let result = write_line(&file, line);

        file.unlock()?;
        result?;

        tracing::debug!("Appended {} event for {} to WAL", kind(event), event.group());
        Ok(())
    }
}

/// Append one JSON line to an already locked file and sync it
fn write_line(file: &File, mut line: String) -> Result<()> {
    if ends_mid_line(file)? {
        line.insert(0, '\n');
    }
    line.push('\n');

    let mut writer = std::io::BufWriter::new(file);
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    drop(writer);

    file.sync_data()?;
    Ok(())
}

/// True when the last write to `file` was torn before its newline
fn ends_mid_line(mut file: &File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn kind(event: &LedgerEvent) -> &'static str {
    match event {
        LedgerEvent::Donation(_) => "donation",
        LedgerEvent::Issue(_) => "issue",
    }
}

/// Read all events from a WAL file
///
/// Lines that fail to parse (a torn final write, manual edits) are logged
/// and skipped so the rest of the ledger stays readable.
pub fn read_events(path: &Path) -> Result<Vec<LedgerEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut events = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = match line_result {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to read WAL line {}: {}", line_num + 1, e);
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<LedgerEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!("Failed to parse event at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} events from WAL", events.len());
    Ok(events)
}

/// Advisory lock over a whole data directory
///
/// Separate processes sharing one data directory each keep their own
/// in-memory ledger, so a mutating process must hold the exclusive lock from
/// replay through commit. The lock is released on drop.
#[derive(Debug)]
pub struct DataDirLock {
    file: File,
}

impl DataDirLock {
    const FILE_NAME: &'static str = "ledger.lock";

    /// Block until no other process holds the directory
    pub fn exclusive(data_dir: &Path) -> Result<Self> {
        let file = Self::open(data_dir)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    /// Block until no writer holds the directory; other readers may share it
    pub fn shared(data_dir: &Path) -> Result<Self> {
        let file = Self::open(data_dir)?;
        file.lock_shared()?;
        Ok(Self { file })
    }

    fn open(data_dir: &Path) -> Result<File> {
        std::fs::create_dir_all(data_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(data_dir.join(Self::FILE_NAME))?;
        Ok(file)
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("Failed to release data directory lock: {}", e);
        }
    }
}
