//! Sequence-numbered records behind the batch contract.
//!
//! [`Batch`] is what every batch source hands out. [`PendingLedger`] is the
//! purely in-memory source used when nothing is persisted; the storage
//! coordinator keeps its backlog on disk instead (see [`super::backlog`]).

use crate::data::ProcessedSample;
use crate::throttle::LogThrottle;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

/// Ordered records handed out for one publish attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Sequence number of the first sample (0 when empty)
    pub first_seq: u64,
    /// Sequence number of the last sample (0 when empty)
    pub last_seq: u64,
    /// Sequence number of each sample; may skip already acknowledged ones
    pub seqs: Vec<u64>,
    pub samples: Vec<ProcessedSample>,
}

impl Batch {
    pub fn new(seqs: Vec<u64>, samples: Vec<ProcessedSample>) -> Self {
        Self {
            first_seq: seqs.first().copied().unwrap_or(0),
            last_seq: seqs.last().copied().unwrap_or(0),
            seqs,
            samples,
        }
    }

    /// A sample-less batch naming one record, for retiring it alone.
    pub fn single(seq: u64) -> Self {
        Self {
            first_seq: seq,
            last_seq: seq,
            seqs: vec![seq],
            samples: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Unacknowledged records held in memory, oldest first, bounded by `capacity`.
///
/// Extraction does not remove anything: a batch that is never acknowledged
/// is returned again by the next extraction. With no disk behind it, a full
/// ledger has to drop its oldest record.
pub struct PendingLedger {
    entries: VecDeque<(u64, ProcessedSample)>,
    next_seq: u64,
    capacity: usize,
    evicted: u64,
    evict_log: LogThrottle,
}

impl PendingLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            next_seq: 1,
            capacity,
            evicted: 0,
            evict_log: LogThrottle::new(Duration::from_secs(10)),
        }
    }

    /// Record a sample and return its sequence number.
    pub fn push(&mut self, sample: ProcessedSample) -> u64 {
        if self.entries.len() >= self.capacity {
            if let Some((seq, _)) = self.entries.pop_front() {
                self.evicted += 1;
                if let Some(suppressed) = self.evict_log.hit() {
                    warn!(
                        seq,
                        capacity = self.capacity,
                        evicted_total = self.evicted,
                        suppressed,
                        "Pending ledger full, oldest untransmitted record dropped"
                    );
                }
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back((seq, sample));
        seq
    }

    /// Up to `max` oldest unacknowledged records.
    pub fn extract(&self, max: usize) -> Batch {
        let (seqs, samples) = self
            .entries
            .iter()
            .take(max)
            .map(|(seq, s)| (*seq, s.clone()))
            .unzip();
        Batch::new(seqs, samples)
    }

    /// Retire records with sequence numbers in `first..=last`; returns how many.
    pub fn acknowledge(&mut self, first: u64, last: u64) -> usize {
        if first == 0 || last < first {
            return 0;
        }
        let before = self.entries.len();
        while matches!(self.entries.front(), Some((seq, _)) if (first..=last).contains(seq)) {
            self.entries.pop_front();
        }
        if self.entries.len() == before {
            // Out-of-order acknowledgement; fall back to a scan.
            self.entries.retain(|(seq, _)| !(first..=last).contains(seq));
        }
        before - self.entries.len()
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Sequence number the next record will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}
