//! Aggregation of "message not acknowledged" conditions.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::warn;

/// Recent ids kept for the diagnostic line.
pub const RETAINED_IDS: usize = 50;
/// Ids shown per diagnostic line.
pub const SHOWN_IDS: usize = 10;
/// Minimum spacing between diagnostic lines.
pub const REPORT_WINDOW: Duration = Duration::from_secs(5);

/// Messages sent with QoS > 0 and their send times.
#[derive(Debug, Default)]
pub struct PendingAcks {
    sent: BTreeMap<u64, Instant>,
}

impl PendingAcks {
    pub fn insert(&mut self, id: u64, at: Instant) {
        self.sent.insert(id, at);
    }

    /// Clear an acknowledged id. Returns false for ids that were not pending.
    pub fn ack(&mut self, id: u64) -> bool {
        self.sent.remove(&id).is_some()
    }

    /// Remove and return ids unacknowledged for at least `timeout`, oldest id first.
    pub fn take_overdue(&mut self, now: Instant, timeout: Duration) -> Vec<u64> {
        let overdue: Vec<u64> = self
            .sent
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &overdue {
            self.sent.remove(id);
        }
        overdue
    }

    /// Remove and return every pending id, oldest id first.
    pub fn take_all(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.sent).into_keys().collect()
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

/// Folds unacknowledged ids into one line per [`REPORT_WINDOW`].
#[derive(Debug)]
pub struct UnackedTracker {
    recent: VecDeque<u64>,
    total: u64,
    unreported: u64,
    last_report: Option<Instant>,
    window: Duration,
}

impl Default for UnackedTracker {
    fn default() -> Self {
        Self::new(REPORT_WINDOW)
    }
}

impl UnackedTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            recent: VecDeque::with_capacity(RETAINED_IDS),
            total: 0,
            unreported: 0,
            last_report: None,
            window,
        }
    }

    /// Note unacknowledged ids; logs and returns the summary when one is due.
    pub fn record(&mut self, ids: &[u64]) -> Option<String> {
        self.record_at(ids, Instant::now())
    }

    pub fn record_at(&mut self, ids: &[u64], now: Instant) -> Option<String> {
        for &id in ids {
            if self.recent.len() == RETAINED_IDS {
                self.recent.pop_front();
            }
            self.recent.push_back(id);
        }
        self.total += ids.len() as u64;
        self.unreported += ids.len() as u64;
        self.report_at(now)
    }

    /// Emit held-back counts once the window has passed.
    pub fn report_at(&mut self, now: Instant) -> Option<String> {
        if self.unreported == 0 {
            return None;
        }
        let due = self
            .last_report
            .map_or(true, |last| now.saturating_duration_since(last) >= self.window);
        if !due {
            return None;
        }
        let line = self.summary();
        warn!(
            unacked = self.unreported,
            total = self.total,
            "{line}"
        );
        self.unreported = 0;
        self.last_report = Some(now);
        Some(line)
    }

    fn summary(&self) -> String {
        let shown: Vec<String> = self
            .recent
            .iter()
            .rev()
            .take(SHOWN_IDS)
            .map(u64::to_string)
            .collect();
        let more = self.recent.len().saturating_sub(SHOWN_IDS);
        let mut line = format!(
            "{} message(s) not acknowledged by broker, latest ids [{}]",
            self.unreported,
            shown.join(", ")
        );
        if more > 0 {
            line.push_str(&format!(" (+{more} more retained)"));
        }
        line.push_str(&format!(", total {}", self.total));
        line
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Retained ids, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = u64> + '_ {
        self.recent.iter().copied()
    }
}
