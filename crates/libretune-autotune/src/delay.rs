//! Lambda delay compensation
//!
//! The wideband reading that arrives now describes combustion that happened
//! some milliseconds ago. Recent engine operating points are kept in a ring
//! buffer so each AFR reading can be paired with the RPM/load it belongs to.

use crate::telemetry::EngineState;
use std::collections::VecDeque;

/// Highest telemetry rate the history buffer is sized for
const MAX_SAMPLE_RATE_HZ: u64 = 200;

/// Smallest history buffer allocated
const MIN_CAPACITY: usize = 16;

/// Why a delayed operating point could not be found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayMiss {
    /// History does not reach back far enough yet
    InsufficientHistory,
    /// No history entry close enough to the delayed timestamp
    HistoryGap,
}

/// Ring buffer of recent engine operating points
#[derive(Debug)]
pub struct DelayCompensator {
    history: VecDeque<EngineState>,
    capacity: usize,
    window_ms: u64,
}

impl DelayCompensator {
    /// Create a buffer that keeps `window_ms` of history
    pub fn new(window_ms: u64) -> Self {
        let capacity = capacity_for(window_ms);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            window_ms,
        }
    }

    /// How far back history is kept
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// No history recorded yet
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Grow or shrink the retained window
    pub fn set_window(&mut self, window_ms: u64) {
        if window_ms == self.window_ms {
            return;
        }
        self.window_ms = window_ms;
        self.capacity = capacity_for(window_ms);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
        self.history.reserve(self.capacity - self.history.len());
    }

    /// Remember an operating point
    ///
    /// Points must arrive in non-decreasing timestamp order.
    pub fn record(&mut self, state: EngineState) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(state);
        self.prune(state.timestamp_ms);
    }

    /// Prune old entries from the history buffer
    fn prune(&mut self, current_timestamp_ms: u64) {
        let cutoff = current_timestamp_ms.saturating_sub(self.window_ms);
        while let Some(front) = self.history.front() {
            if front.timestamp_ms < cutoff {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Operating point recorded closest to `now_ms - delay_ms`
    ///
    /// Ties go to the older entry. A delay of zero returns the newest entry at
    /// `now_ms` when one was recorded.
    pub fn lookup(
        &self,
        now_ms: u64,
        delay_ms: u64,
        max_gap_ms: u64,
    ) -> Result<EngineState, DelayMiss> {
        let target = now_ms
            .checked_sub(delay_ms)
            .ok_or(DelayMiss::InsufficientHistory)?;

        let oldest = self.history.front().ok_or(DelayMiss::InsufficientHistory)?;
        if oldest.timestamp_ms > target {
            return Err(DelayMiss::InsufficientHistory);
        }

        // First entry at or after the target; the one before it is at or before
        let after = self.history.partition_point(|s| s.timestamp_ms < target);
        let before = after.checked_sub(1).and_then(|i| self.history.get(i));
        let at_or_after = self.history.get(after);

        let nearest = match (before, at_or_after) {
            (Some(b), Some(a)) => {
                if target - b.timestamp_ms <= a.timestamp_ms - target {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return Err(DelayMiss::InsufficientHistory),
        };

        if nearest.timestamp_ms.abs_diff(target) > max_gap_ms {
            return Err(DelayMiss::HistoryGap);
        }

        Ok(*nearest)
    }

    /// Forget all history
    pub fn clear(&mut self) {
        self.history.clear();
    }
}

fn capacity_for(window_ms: u64) -> usize {
    let entries = window_ms.saturating_mul(MAX_SAMPLE_RATE_HZ) / 1000 + 1;
    usize::try_from(entries).unwrap_or(usize::MAX).max(MIN_CAPACITY)
}
