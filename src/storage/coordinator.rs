//! Storage coordinator: active session, rotation, backlog and retention.

use super::backlog::{ack_path, mark_complete, Backlog};
use super::ledger::Batch;
use super::record::encode_record;
use super::session::{is_data_file, session_id, SessionFile};
use crate::config::StorageConfig;
use crate::data::ProcessedSample;
use crate::error::{AppResult, DaqError};
use chrono::Local;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Counters reported by [`StorageCoordinator::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStats {
    pub session: String,
    pub records_stored: u64,
    pub records_dropped: u64,
    pub files_closed: u64,
    pub write_errors: u64,
    pub pending: usize,
    pub evicted: u64,
    pub files_removed: u64,
    /// Unacknowledged records found on disk at startup
    pub recovered: u64,
    pub active_file: Option<PathBuf>,
}

/// Result of one retention sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub bytes_freed: u64,
}

/// Remove data files under `dir` whose modification time is older than `max_age`.
///
/// Only files named `{prefix}_*.csv` or `{prefix}_*.jsonl` are considered,
/// and their `.ack` companions go with them; `active` is never removed.
pub fn sweep_directory(
    dir: &Path,
    prefix: &str,
    max_age: Duration,
    active: Option<&Path>,
) -> AppResult<SweepReport> {
    let mut report = SweepReport::default();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(DaqError::Storage(format!("read {}: {e}", dir.display()))),
    };
    let now = SystemTime::now();

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if Some(path.as_path()) == active || !is_data_file(&path, prefix) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age >= max_age {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(file = %path.display(), age_s = age.as_secs(), "Removed expired data file");
                    if let Err(e) = std::fs::remove_file(ack_path(&path)) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(file = %path.display(), error = %e, "Could not remove acknowledgement file");
                        }
                    }
                    report.bytes_freed += metadata.len();
                    report.removed.push(path);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Could not remove expired data file"),
            }
        }
    }
    Ok(report)
}

/// Exclusive owner of the active session file.
pub struct StorageCoordinator {
    config: StorageConfig,
    session: String,
    next_part: u32,
    active: Option<SessionFile>,
    closed: Vec<PathBuf>,
    /// Absent when nothing extracts batches
    backlog: Option<Backlog>,
    stats: StorageStats,
}

impl StorageCoordinator {
    /// Open storage with a batch backlog, picking up records that earlier
    /// runs stored but never got acknowledged.
    pub fn new(config: StorageConfig) -> AppResult<Self> {
        create_base_dir(&config)?;
        let backlog = Backlog::recover(
            config.pending_capacity,
            &config.base_dir,
            &config.session_prefix,
        )?;
        Ok(Self::start(config, Some(backlog)))
    }

    /// Open storage for a publisher that never extracts batches. Closed files
    /// are marked delivered so a later batch run does not resend them.
    pub fn without_backlog(config: StorageConfig) -> AppResult<Self> {
        create_base_dir(&config)?;
        Ok(Self::start(config, None))
    }

    fn start(config: StorageConfig, backlog: Option<Backlog>) -> Self {
        let session = session_id(&config.session_prefix, Local::now());
        info!(
            session = %session,
            dir = %config.base_dir.display(),
            format = ?config.format,
            backlog = backlog.is_some(),
            "Storage session started"
        );
        Self {
            stats: StorageStats {
                session: session.clone(),
                recovered: backlog.as_ref().map_or(0, Backlog::recovered),
                ..Default::default()
            },
            backlog,
            config,
            session,
            next_part: 1,
            active: None,
            closed: Vec::new(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Persist one sample and enter it in the backlog; returns its sequence
    /// number (0 without a backlog).
    ///
    /// A sample that cannot be written still enters the backlog, so batch
    /// publishing continues while the storage path is broken.
    pub fn store(&mut self, sample: ProcessedSample) -> AppResult<u64> {
        let record = match encode_record(self.config.format, &sample) {
            Ok(record) => record,
            Err(e) => {
                self.stats.records_dropped += 1;
                self.track_unwritten(sample);
                return Err(e);
            }
        };
        let index = match self.append(&record) {
            Ok(index) => index,
            Err(e) => {
                self.stats.write_errors += 1;
                self.track_unwritten(sample);
                return Err(e);
            }
        };
        self.stats.records_stored += 1;

        let seq = match (self.backlog.as_mut(), self.active.as_ref()) {
            (Some(backlog), Some(file)) => {
                backlog.push_stored(sample, file.path(), self.config.format, index)
            }
            _ => 0,
        };
        if self.rotation_due() {
            self.rotate("threshold")?;
        }
        Ok(seq)
    }

    fn track_unwritten(&mut self, sample: ProcessedSample) {
        if let Some(backlog) = self.backlog.as_mut() {
            backlog.push_unstored(sample);
        }
    }

    /// Append one record to the active file, opening it first if needed.
    /// Returns the record's index within the file.
    fn append(&mut self, record: &[u8]) -> AppResult<u64> {
        if self.active.is_none() {
            let file = SessionFile::create(
                &self.config.base_dir,
                &self.session,
                self.next_part,
                self.config.format,
            )?;
            debug!(file = %file.path().display(), "Opened data file");
            self.next_part += 1;
            self.active = Some(file);
        }
        match self.active.as_mut() {
            Some(file) => {
                let index = file.records();
                file.append(record)?;
                Ok(index)
            }
            None => Err(DaqError::Storage("no active file".into())),
        }
    }

    fn rotation_due(&self) -> bool {
        self.active.as_ref().is_some_and(|f| {
            f.bytes() >= self.config.max_file_size_bytes() || f.age() >= self.config.max_file_age()
        })
    }

    /// Close the active file; the next record opens a new part.
    ///
    /// Returns the closed file, if one was open.
    pub fn rotate(&mut self, reason: &str) -> AppResult<Option<PathBuf>> {
        let Some(file) = self.active.take() else {
            return Ok(None);
        };
        let records = file.records();
        let bytes = file.bytes();
        let path = file.path().to_path_buf();
        // The part is on disk whether or not the final flush succeeds.
        self.stats.files_closed += 1;
        self.closed.push(path.clone());
        match self.backlog.as_mut() {
            Some(backlog) => backlog.seal(&path),
            None => {
                if let Err(e) = mark_complete(&path) {
                    debug!(file = %path.display(), error = %e, "Could not mark data file delivered");
                }
            }
        }
        file.close()?;
        info!(file = %path.display(), records, bytes, reason, "Rotated data file");
        Ok(Some(path))
    }

    /// Up to `max` oldest unacknowledged records, read back from disk when
    /// they are no longer held in memory.
    pub fn extract_batch(&mut self, max: usize) -> Batch {
        let Some(backlog) = self.backlog.as_mut() else {
            return Batch::default();
        };
        if backlog.reaches_disk() {
            if let Some(file) = self.active.as_mut() {
                if let Err(e) = file.flush() {
                    warn!(error = %e, "Flush before reading back pending records failed");
                }
            }
        }
        backlog.extract(max)
    }

    /// Retire the records of `batch`.
    pub fn acknowledge(&mut self, batch: &Batch) -> usize {
        self.acknowledge_range(batch.first_seq, batch.last_seq)
    }

    pub fn acknowledge_range(&mut self, first: u64, last: u64) -> usize {
        self.backlog
            .as_mut()
            .map_or(0, |backlog| backlog.acknowledge(first, last))
    }

    /// Remove closed files older than the configured retention.
    pub fn sweep(&mut self) -> AppResult<SweepReport> {
        self.sweep_older_than(self.config.retention())
    }

    pub fn sweep_older_than(&mut self, max_age: Duration) -> AppResult<SweepReport> {
        let active = self.active.as_ref().map(|f| f.path().to_path_buf());
        let report = sweep_directory(
            &self.config.base_dir,
            &self.config.session_prefix,
            max_age,
            active.as_deref(),
        )?;
        if !report.removed.is_empty() {
            info!(
                removed = report.removed.len(),
                bytes_freed = report.bytes_freed,
                "Retention sweep"
            );
            self.closed.retain(|p| !report.removed.contains(p));
            self.stats.files_removed += report.removed.len() as u64;
            if let Some(backlog) = self.backlog.as_mut() {
                let lost: u64 = report.removed.iter().map(|p| backlog.forget_file(p)).sum();
                if lost > 0 {
                    warn!(lost, "Retention removed records that were never acknowledged");
                }
            }
        }
        Ok(report)
    }

    pub fn flush(&mut self) -> AppResult<()> {
        match self.active.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    /// Data files of this session in creation order, the active one last.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files = self.closed.clone();
        if let Some(active) = &self.active {
            files.push(active.path().to_path_buf());
        }
        files
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            pending: self.backlog.as_ref().map_or(0, Backlog::pending),
            evicted: self.backlog.as_ref().map_or(0, Backlog::evicted),
            active_file: self.active.as_ref().map(|f| f.path().to_path_buf()),
            ..self.stats.clone()
        }
    }

    /// Close the active file.
    pub fn close(&mut self) -> AppResult<()> {
        self.rotate("shutdown").map(|_| ())
    }
}

fn create_base_dir(config: &StorageConfig) -> AppResult<()> {
    std::fs::create_dir_all(&config.base_dir)
        .map_err(|e| DaqError::Storage(format!("create {}: {e}", config.base_dir.display())))
}
