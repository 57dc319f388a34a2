//! Sliding-window count of unhealthy health-check verdicts.
//!
//! Entries older than the window are pruned lazily on each record. A
//! healthy verdict never clears the ledger; only expiry or an explicit
//! `clear` (after a successful restart) does.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct UnhealthyLedger {
    occurrences: VecDeque<Instant>,
}

impl UnhealthyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an unhealthy verdict at `now` and return how many verdicts
    /// fall within the trailing `window`.
    pub fn record(&mut self, now: Instant, window: Duration) -> usize {
        self.prune(now, window);
        self.occurrences.push_back(now);
        self.occurrences.len()
    }

    /// Record an unhealthy verdict; true when the retained count reaches
    /// `threshold`.
    pub fn record_and_check(&mut self, now: Instant, window: Duration, threshold: u32) -> bool {
        self.record(now, window) >= threshold as usize
    }

    /// Drop entries that are older than `window` as of `now`.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.occurrences.front() {
            if now.saturating_duration_since(oldest) > window {
                self.occurrences.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.occurrences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }

    pub fn clear(&mut self) {
        self.occurrences.clear();
    }
}
