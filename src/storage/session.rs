//! A contiguous run of output and its currently open file.

use super::record::encode_preamble;
use crate::config::StorageFormat;
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

const STAMP: &str = "%Y%m%d_%H%M%S";

/// Session identifier: `{prefix}_{YYYYmmdd_HHMMSS}`.
pub fn session_id(prefix: &str, started: DateTime<Local>) -> String {
    format!("{prefix}_{}", started.format(STAMP))
}

/// File name of one part: `{session}_part{NNN}_{YYYYmmdd_HHMMSS}.{ext}`.
pub fn part_file_name(
    session: &str,
    part: u32,
    opened: DateTime<Local>,
    format: StorageFormat,
) -> String {
    format!(
        "{session}_part{part:03}_{}.{}",
        opened.format(STAMP),
        format.extension()
    )
}

/// Whether `path` is a data file written under `prefix`.
pub fn is_data_file(path: &Path, prefix: &str) -> bool {
    let name_prefix = format!("{prefix}_");
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(&name_prefix))
        && StorageFormat::from_path(path).is_some()
}

/// Data files under `dir` in write order (session, then part).
pub fn list_data_files(dir: &Path, prefix: &str) -> AppResult<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DaqError::Storage(format!("read {}: {e}", dir.display()))),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_data_file(&path, prefix) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// An open part file. Writes are buffered; every append is a whole record.
pub struct SessionFile {
    path: PathBuf,
    part: u32,
    format: StorageFormat,
    writer: BufWriter<File>,
    opened_at: Instant,
    bytes: u64,
    records: u64,
}

impl SessionFile {
    /// Create part `part` of `session` under `dir` and write its preamble.
    pub fn create(
        dir: &Path,
        session: &str,
        part: u32,
        format: StorageFormat,
    ) -> AppResult<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| DaqError::Storage(format!("create {}: {e}", dir.display())))?;
        let path = dir.join(part_file_name(session, part, Local::now(), format));
        // Never reopen a file an earlier run left behind; its record indices
        // are referenced by its ack file.
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| DaqError::Storage(format!("open {}: {e}", path.display())))?;

        let mut session_file = Self {
            path,
            part,
            format,
            writer: BufWriter::new(file),
            opened_at: Instant::now(),
            bytes: 0,
            records: 0,
        };
        let preamble = encode_preamble(format)?;
        if !preamble.is_empty() {
            session_file.write_bytes(&preamble)?;
        }
        Ok(session_file)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.writer
            .write_all(bytes)
            .map_err(|e| DaqError::Storage(format!("write {}: {e}", self.path.display())))?;
        self.bytes += bytes.len() as u64;
        Ok(())
    }

    /// Append one encoded record.
    pub fn append(&mut self, record: &[u8]) -> AppResult<()> {
        self.write_bytes(record)?;
        self.records += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> AppResult<()> {
        self.writer
            .flush()
            .map_err(|e| DaqError::Storage(format!("flush {}: {e}", self.path.display())))
    }

    /// Flush and sync, consuming the handle.
    pub fn close(mut self) -> AppResult<PathBuf> {
        self.flush()?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| DaqError::Storage(format!("sync {}: {e}", self.path.display())))?;
        Ok(self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn part(&self) -> u32 {
        self.part
    }

    pub fn format(&self) -> StorageFormat {
        self.format
    }

    /// Bytes written so far, buffered ones included.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn age(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }
}
