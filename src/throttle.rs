//! Rate limiting for repeated diagnostics.
//!
//! A condition that repeats many times a second (a stream of bad checksums, a
//! broker that is down) should produce one log line per window with a count of
//! what was folded into it, never one line per occurrence and never silence.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Emits at most once per window and counts what it held back.
#[derive(Debug, Clone)]
pub struct LogThrottle {
    window: Duration,
    last_emit: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    /// Create a throttle that lets one line through per `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emit: None,
            suppressed: 0,
        }
    }

    /// Record an occurrence now.
    ///
    /// Returns `Some(n)` when a line should be logged, where `n` is the number of
    /// occurrences suppressed since the previous line. Returns `None` otherwise.
    pub fn hit(&mut self) -> Option<u64> {
        self.hit_at(Instant::now())
    }

    /// Record an occurrence at an explicit instant.
    pub fn hit_at(&mut self, now: Instant) -> Option<u64> {
        let due = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.window,
        };
        if due {
            let folded = self.suppressed;
            self.suppressed = 0;
            self.last_emit = Some(now);
            Some(folded)
        } else {
            self.suppressed += 1;
            None
        }
    }

    /// Occurrences held back since the last emitted line.
    pub fn pending(&self) -> u64 {
        self.suppressed
    }
}

/// One [`LogThrottle`] per distinct key, so unrelated errors do not mask each other.
#[derive(Debug)]
pub struct KeyedThrottle<K> {
    window: Duration,
    throttles: HashMap<K, LogThrottle>,
}

impl<K: Eq + Hash> KeyedThrottle<K> {
    /// Create an empty keyed throttle.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            throttles: HashMap::new(),
        }
    }

    /// Record an occurrence of `key`; see [`LogThrottle::hit`].
    pub fn hit(&mut self, key: K) -> Option<u64> {
        self.hit_at(key, Instant::now())
    }

    /// Record an occurrence of `key` at an explicit instant.
    pub fn hit_at(&mut self, key: K, now: Instant) -> Option<u64> {
        let window = self.window;
        self.throttles
            .entry(key)
            .or_insert_with(|| LogThrottle::new(window))
            .hit_at(now)
    }
}
