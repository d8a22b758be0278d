//! Disk-backed backlog of records not yet acknowledged by the publisher.
//!
//! Every stored record gets a sequence number and a place in a data file.
//! Only the newest `capacity` records are held in memory; older ones are read
//! back from their file when extracted. Acknowledgements are appended to an
//! `.ack` file next to each data file, so after a restart the backlog is
//! rebuilt from whatever was never acknowledged.
//!
//! Ack file format, one entry per line:
//!
//! ```text
//! 0 99        record indices 0..=99 of the data file were delivered
//! complete    the file is closed and every record was delivered
//! ```

use super::ledger::Batch;
use super::record::read_intact_records;
use super::session::list_data_files;
use crate::config::StorageFormat;
use crate::data::ProcessedSample;
use crate::error::{AppResult, DaqError};
use crate::throttle::LogThrottle;
use std::collections::{BTreeMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const COMPLETE: &str = "complete";

/// Companion file holding the acknowledgements of `data_file`.
pub fn ack_path(data_file: &Path) -> PathBuf {
    let mut name = data_file.as_os_str().to_owned();
    name.push(".ack");
    PathBuf::from(name)
}

fn append_ack_line(data_file: &Path, line: &str) -> AppResult<()> {
    let path = ack_path(data_file);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| DaqError::Storage(format!("open {}: {e}", path.display())))?;
    writeln!(file, "{line}").map_err(|e| DaqError::Storage(format!("write {}: {e}", path.display())))
}

/// Record that every record of a closed data file has been delivered.
pub fn mark_complete(data_file: &Path) -> AppResult<()> {
    append_ack_line(data_file, COMPLETE)
}

#[derive(Debug, Default)]
struct AckLog {
    complete: bool,
    ranges: Vec<(u64, u64)>,
}

/// Parse the ack file of `data_file`. Lines that do not parse (a torn last
/// write) are ignored, which at worst sends those records again.
fn read_ack_log(data_file: &Path) -> AckLog {
    let mut log = AckLog::default();
    let Ok(text) = std::fs::read_to_string(ack_path(data_file)) else {
        return log;
    };
    for line in text.lines() {
        let line = line.trim();
        if line == COMPLETE {
            log.complete = true;
            continue;
        }
        let mut parts = line.split_whitespace().map(str::parse::<u64>);
        if let (Some(Ok(first)), Some(Ok(last)), None) = (parts.next(), parts.next(), parts.next()) {
            if first <= last {
                log.ranges.push((first, last));
            }
        }
    }
    log.ranges.sort_unstable();
    log
}

/// Disjoint inclusive ranges of pending sequence numbers.
#[derive(Debug, Default)]
struct SeqRanges {
    ranges: BTreeMap<u64, u64>,
    len: u64,
}

impl SeqRanges {
    /// Add `first..=last`, which must lie above every range already held.
    fn append(&mut self, first: u64, last: u64) {
        if let Some(end) = self.ranges.values_mut().next_back() {
            if *end + 1 == first {
                *end = last;
                self.len += last - first + 1;
                return;
            }
        }
        self.ranges.insert(first, last);
        self.len += last - first + 1;
    }

    /// Remove `first..=last`; returns how many were pending.
    fn remove(&mut self, first: u64, last: u64) -> u64 {
        let overlapping: Vec<(u64, u64)> = self
            .ranges
            .range(..=last)
            .rev()
            .take_while(|(_, &end)| end >= first)
            .map(|(&start, &end)| (start, end))
            .collect();
        let mut removed = 0;
        for (start, end) in overlapping {
            self.ranges.remove(&start);
            if start < first {
                self.ranges.insert(start, first - 1);
            }
            if end > last {
                self.ranges.insert(last + 1, end);
            }
            removed += end.min(last) - start.max(first) + 1;
        }
        self.len -= removed;
        removed
    }

    fn contains_any(&self, first: u64, last: u64) -> bool {
        self.ranges
            .range(..=last)
            .next_back()
            .is_some_and(|(_, &end)| end >= first)
    }

    fn first(&self) -> Option<u64> {
        self.ranges.keys().next().copied()
    }

    fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|(&start, &end)| start..=end)
    }
}

#[derive(Debug)]
enum Backing {
    /// Records at `first_index..` of a data file
    File {
        path: PathBuf,
        format: StorageFormat,
        first_index: u64,
        sealed: bool,
    },
    /// Records whose write failed; memory is their only copy
    Memory(VecDeque<ProcessedSample>),
}

/// A run of consecutive sequence numbers with one backing.
#[derive(Debug)]
struct Segment {
    first_seq: u64,
    len: u64,
    backing: Backing,
}

impl Segment {
    fn last_seq(&self) -> u64 {
        self.first_seq + self.len - 1
    }

    fn in_file(&self, file: &Path) -> bool {
        matches!(&self.backing, Backing::File { path, .. } if path == file)
    }
}

/// The last data file read back, kept while its records are being extracted.
struct Page {
    path: PathBuf,
    samples: Vec<ProcessedSample>,
}

enum Location {
    Memory(ProcessedSample),
    File {
        path: PathBuf,
        format: StorageFormat,
        index: usize,
    },
}

/// Unacknowledged records in sequence order, on disk with a bounded memory tail.
pub struct Backlog {
    segments: VecDeque<Segment>,
    pending: SeqRanges,
    next_seq: u64,
    capacity: usize,
    /// Newest file-backed records
    window: VecDeque<(u64, ProcessedSample)>,
    memory_records: usize,
    page: Option<Page>,
    evicted: u64,
    recovered: u64,
    evict_log: LogThrottle,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            segments: VecDeque::new(),
            pending: SeqRanges::default(),
            next_seq: 1,
            capacity,
            window: VecDeque::with_capacity(capacity.min(4096)),
            memory_records: 0,
            page: None,
            evicted: 0,
            recovered: 0,
            evict_log: LogThrottle::new(Duration::from_secs(10)),
        }
    }

    /// Rebuild the backlog from the data files under `dir` that still hold
    /// unacknowledged records.
    pub fn recover(capacity: usize, dir: &Path, prefix: &str) -> AppResult<Self> {
        let mut backlog = Self::new(capacity);
        let mut files = 0usize;
        for path in list_data_files(dir, prefix)? {
            let Some(format) = StorageFormat::from_path(&path) else {
                continue;
            };
            let acks = read_ack_log(&path);
            if acks.complete {
                continue;
            }
            let records = match read_intact_records(&path, format) {
                Ok(records) => records.len() as u64,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Unreadable data file left out of the backlog");
                    continue;
                }
            };
            if backlog.adopt_file(path, format, records, &acks.ranges) {
                files += 1;
            }
        }
        backlog.recovered = backlog.pending.len;
        if backlog.recovered > 0 {
            info!(
                files,
                records = backlog.recovered,
                "Recovered unacknowledged records from earlier runs"
            );
        }
        Ok(backlog)
    }

    /// Enter a closed data file of `records` records, minus the acknowledged
    /// index ranges. Returns false when nothing in it is pending.
    fn adopt_file(&mut self, path: PathBuf, format: StorageFormat, records: u64, acked: &[(u64, u64)]) -> bool {
        let first_seq = self.next_seq;
        let before = self.pending.len;
        let mut cursor = 0;
        for &(first, last) in acked {
            if first >= records {
                break;
            }
            if first > cursor {
                self.pending.append(first_seq + cursor, first_seq + first - 1);
            }
            cursor = cursor.max(last + 1);
        }
        if cursor < records {
            self.pending.append(first_seq + cursor, first_seq + records - 1);
        }
        if self.pending.len == before {
            if let Err(e) = mark_complete(&path) {
                debug!(file = %path.display(), error = %e, "Could not mark data file delivered");
            }
            return false;
        }
        self.next_seq += records;
        self.segments.push_back(Segment {
            first_seq,
            len: records,
            backing: Backing::File {
                path,
                format,
                first_index: 0,
                sealed: true,
            },
        });
        true
    }

    fn allocate(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.append(seq, seq);
        seq
    }

    /// Enter a record written as record `index` of `file`.
    pub fn push_stored(&mut self, sample: ProcessedSample, file: &Path, format: StorageFormat, index: u64) -> u64 {
        let seq = self.allocate();
        let extends = self.segments.back().is_some_and(|s| {
            s.last_seq() + 1 == seq
                && matches!(&s.backing, Backing::File { path, first_index, .. }
                    if path == file && first_index + s.len == index)
        });
        match self.segments.back_mut() {
            Some(segment) if extends => segment.len += 1,
            _ => self.segments.push_back(Segment {
                first_seq: seq,
                len: 1,
                backing: Backing::File {
                    path: file.to_path_buf(),
                    format,
                    first_index: index,
                    sealed: false,
                },
            }),
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back((seq, sample));
        seq
    }

    /// Enter a record that could not be written. It lives in memory only and
    /// is dropped, with a warning, once `capacity` such records are held.
    pub fn push_unstored(&mut self, sample: ProcessedSample) -> u64 {
        let seq = self.allocate();
        let extends = self
            .segments
            .back()
            .is_some_and(|s| s.last_seq() + 1 == seq && matches!(s.backing, Backing::Memory(_)));
        match self.segments.back_mut() {
            Some(Segment {
                len,
                backing: Backing::Memory(samples),
                ..
            }) if extends => {
                samples.push_back(sample);
                *len += 1;
            }
            _ => self.segments.push_back(Segment {
                first_seq: seq,
                len: 1,
                backing: Backing::Memory(VecDeque::from([sample])),
            }),
        }
        self.memory_records += 1;
        if self.memory_records > self.capacity {
            self.evict_unstored();
        }
        seq
    }

    fn evict_unstored(&mut self) {
        let Some(index) = self
            .segments
            .iter()
            .position(|s| matches!(s.backing, Backing::Memory(_)))
        else {
            return;
        };
        let segment = &mut self.segments[index];
        let seq = segment.first_seq;
        if let Backing::Memory(samples) = &mut segment.backing {
            samples.pop_front();
        }
        segment.first_seq += 1;
        segment.len -= 1;
        if segment.len == 0 {
            self.segments.remove(index);
        }
        self.memory_records -= 1;

        if self.pending.remove(seq, seq) > 0 {
            self.evicted += 1;
            if let Some(suppressed) = self.evict_log.hit() {
                warn!(
                    seq,
                    capacity = self.capacity,
                    evicted_total = self.evicted,
                    suppressed,
                    "Unwritten record dropped from the backlog"
                );
            }
        }
    }

    /// `file` will not grow any more.
    pub fn seal(&mut self, file: &Path) {
        let mut referenced = false;
        for segment in self.segments.iter_mut() {
            if let Backing::File { path, sealed, .. } = &mut segment.backing {
                if path.as_path() == file {
                    *sealed = true;
                    referenced = true;
                }
            }
        }
        if !referenced {
            self.file_delivered(file);
        }
    }

    /// Whether extraction will have to read a data file, which must then be
    /// flushed first.
    pub fn reaches_disk(&self) -> bool {
        match (self.pending.first(), self.window.front()) {
            (None, _) => false,
            (Some(first), Some((oldest, _))) => first < *oldest,
            (Some(_), None) => true,
        }
    }

    /// Up to `max` oldest unacknowledged records.
    ///
    /// A data file that can no longer be read is dropped from the backlog with
    /// an error rather than blocking every later extraction.
    pub fn extract(&mut self, max: usize) -> Batch {
        loop {
            match self.try_extract(max) {
                Ok(batch) => return batch,
                Err((path, e)) => {
                    let lost = self.forget_file(&path);
                    error!(file = %path.display(), error = %e, lost, "Pending records unreadable, dropped from the backlog");
                }
            }
        }
    }

    fn try_extract(&mut self, max: usize) -> Result<Batch, (PathBuf, DaqError)> {
        let wanted: Vec<u64> = self.pending.iter().take(max).collect();
        let mut seqs = Vec::with_capacity(wanted.len());
        let mut samples = Vec::with_capacity(wanted.len());
        for seq in wanted {
            let sample = match self.locate(seq) {
                Some(Location::Memory(sample)) => sample,
                Some(Location::File { path, format, index }) => match self.read_back(&path, format, index) {
                    Ok(sample) => sample,
                    Err(e) => return Err((path, e)),
                },
                None => continue,
            };
            seqs.push(seq);
            samples.push(sample);
        }
        Ok(Batch::new(seqs, samples))
    }

    fn locate(&self, seq: u64) -> Option<Location> {
        if let Ok(i) = self.window.binary_search_by_key(&seq, |(s, _)| *s) {
            return Some(Location::Memory(self.window[i].1.clone()));
        }
        let i = self.segments.partition_point(|s| s.last_seq() < seq);
        let segment = self.segments.get(i).filter(|s| s.first_seq <= seq)?;
        let offset = seq - segment.first_seq;
        match &segment.backing {
            Backing::Memory(samples) => samples.get(offset as usize).cloned().map(Location::Memory),
            Backing::File {
                path,
                format,
                first_index,
                ..
            } => Some(Location::File {
                path: path.clone(),
                format: *format,
                index: (first_index + offset) as usize,
            }),
        }
    }

    fn read_back(&mut self, path: &Path, format: StorageFormat, index: usize) -> AppResult<ProcessedSample> {
        let stale = self
            .page
            .as_ref()
            .map_or(true, |page| page.path != path || index >= page.samples.len());
        if stale {
            let samples = read_intact_records(path, format)?;
            debug!(file = %path.display(), records = samples.len(), "Paged data file into the backlog");
            self.page = Some(Page {
                path: path.to_path_buf(),
                samples,
            });
        }
        self.page
            .as_ref()
            .and_then(|page| page.samples.get(index))
            .cloned()
            .ok_or_else(|| DaqError::Storage(format!("record {index} missing from {}", path.display())))
    }

    /// Retire records `first..=last`; returns how many were pending.
    ///
    /// The acknowledgement is written to the ack files before returning. A
    /// failed write is logged and only means those records may be sent again
    /// after a restart.
    pub fn acknowledge(&mut self, first: u64, last: u64) -> usize {
        if first == 0 || last < first {
            return 0;
        }
        let removed = self.pending.remove(first, last);
        if removed == 0 {
            return 0;
        }
        for segment in &self.segments {
            let Backing::File { path, first_index, .. } = &segment.backing else {
                continue;
            };
            let (lo, hi) = (first.max(segment.first_seq), last.min(segment.last_seq()));
            if lo > hi {
                continue;
            }
            let line = format!(
                "{} {}",
                first_index + (lo - segment.first_seq),
                first_index + (hi - segment.first_seq)
            );
            if let Err(e) = append_ack_line(path, &line) {
                warn!(file = %path.display(), error = %e, "Acknowledgement not persisted");
            }
        }
        self.retire_delivered();
        removed as usize
    }

    /// Drop leading segments with nothing left pending.
    fn retire_delivered(&mut self) {
        while let Some(front) = self.segments.front() {
            if self.pending.contains_any(front.first_seq, front.last_seq()) {
                break;
            }
            let Some(segment) = self.segments.pop_front() else {
                break;
            };
            match segment.backing {
                Backing::File { path, sealed, .. } => {
                    if sealed && !self.segments.iter().any(|s| s.in_file(&path)) {
                        self.file_delivered(&path);
                    }
                }
                Backing::Memory(samples) => self.memory_records -= samples.len(),
            }
        }
    }

    fn file_delivered(&mut self, file: &Path) {
        if self.page.as_ref().is_some_and(|page| page.path == file) {
            self.page = None;
        }
        if let Err(e) = mark_complete(file) {
            warn!(file = %file.display(), error = %e, "Could not mark data file delivered");
        }
    }

    /// Drop the records of `file`, which is gone, except those still held in
    /// memory. Returns how many pending records were lost.
    pub fn forget_file(&mut self, file: &Path) -> u64 {
        let in_memory_from = self.window.front().map_or(u64::MAX, |(seq, _)| *seq);
        let mut lost = 0;
        for segment in self.segments.iter().filter(|s| s.in_file(file)) {
            let last = segment.last_seq().min(in_memory_from.saturating_sub(1));
            if segment.first_seq <= last {
                lost += self.pending.remove(segment.first_seq, last);
            }
        }
        self.segments.retain(|s| !s.in_file(file));
        if self.page.as_ref().is_some_and(|page| page.path == file) {
            self.page = None;
        }
        lost
    }

    pub fn pending(&self) -> usize {
        self.pending.len as usize
    }

    /// Unwritten records dropped for lack of memory.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Records found unacknowledged on disk at startup.
    pub fn recovered(&self) -> u64 {
        self.recovered
    }
}
