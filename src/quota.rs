// Daily tile-quota tracker.
//
// Edge-triggered warning: `warning_triggered` flips to true at most
// once per UTC day, the moment usage crosses `threshold_ratio`.

#![allow(clippy::expect_used)]

use std::sync::Mutex;

use chrono::{NaiveDate, Utc};

/// Point-in-time quota status returned to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaStatus {
    pub limit: Option<u64>,
    pub used: u64,
    pub threshold_ratio: f64,
    pub warning_triggered: bool,
}

struct QuotaDay {
    date: NaiveDate,
    used: u64,
    warned: bool,
}

/// Process-wide quota tracker; resettable for tests.
pub struct QuotaTracker {
    limit: Option<u64>,
    threshold_ratio: f64,
    state: Mutex<QuotaDay>,
}

impl QuotaTracker {
    pub fn new(limit: Option<u64>) -> Self {
        Self::with_threshold(limit, 0.7)
    }

    pub fn with_threshold(limit: Option<u64>, threshold_ratio: f64) -> Self {
        Self {
            limit,
            threshold_ratio,
            state: Mutex::new(QuotaDay {
                date: Utc::now().date_naive(),
                used: 0,
                warned: false,
            }),
        }
    }

    /// Record `count` tiles submitted, rolling over the counter if a
    /// UTC day boundary was crossed since the last record.
    pub fn record(&self, count: u64) -> QuotaStatus {
        let today = Utc::now().date_naive();
        let mut state = self.state.lock().expect("quota tracker lock poisoned");
        if state.date != today {
            state.date = today;
            state.used = 0;
            state.warned = false;
        }
        state.used += count;

        let mut just_triggered = false;
        if !state.warned {
            if let Some(limit) = self.limit {
                if limit > 0 && (state.used as f64) >= (limit as f64) * self.threshold_ratio {
                    state.warned = true;
                    just_triggered = true;
                }
            }
        }

        QuotaStatus {
            limit: self.limit,
            used: state.used,
            threshold_ratio: self.threshold_ratio,
            warning_triggered: just_triggered,
        }
    }

    /// Current status without recording new usage.
    pub fn status(&self) -> QuotaStatus {
        let today = Utc::now().date_naive();
        let state = self.state.lock().expect("quota tracker lock poisoned");
        let used = if state.date == today { state.used } else { 0 };
        QuotaStatus {
            limit: self.limit,
            used,
            threshold_ratio: self.threshold_ratio,
            warning_triggered: false,
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().expect("quota tracker lock poisoned");
        state.date = Utc::now().date_naive();
        state.used = 0;
        state.warned = false;
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_triggers_once_per_day() {
        let tracker = QuotaTracker::with_threshold(Some(100), 0.7);
        let first = tracker.record(50);
        assert!(!first.warning_triggered);
        let second = tracker.record(25);
        assert!(second.warning_triggered);
        assert_eq!(second.used, 75);
        let third = tracker.record(10);
        assert!(!third.warning_triggered);
    }

    #[test]
    fn no_limit_never_warns() {
        let tracker = QuotaTracker::new(None);
        let status = tracker.record(1_000_000);
        assert!(!status.warning_triggered);
        assert_eq!(status.limit, None);
    }

    #[test]
    fn reset_clears_usage() {
        let tracker = QuotaTracker::with_threshold(Some(10), 0.5);
        tracker.record(8);
        tracker.reset();
        let status = tracker.status();
        assert_eq!(status.used, 0);
    }
}
