// Per-backend circuit breaker registry.
//
// Native implementation: closed/open/half-open states keyed by
// backend_id, with doubling cooldown on repeated half-open failures.

#![allow(clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const FAILURE_THRESHOLD: u32 = 2;
const BASE_COOLDOWN_S: u64 = 60;
const MAX_COOLDOWN_S: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    failure_count: u32,
    open_until_ts: Option<u64>,
    cooldown_s: u64,
    last_reason: Option<String>,
    half_open_probe_in_flight: bool,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            failure_count: 0,
            open_until_ts: None,
            cooldown_s: BASE_COOLDOWN_S,
            last_reason: None,
            half_open_probe_in_flight: false,
        }
    }
}

fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Process-wide, resettable registry of per-backend circuit breaker
/// state.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current externally-visible state for `backend_id`. Once the
    /// open cooldown elapses, this returns `HalfOpen` and marks a probe
    /// as pending (the next `record_failure`/`record_success` clears
    /// it).
    pub fn state(&self, backend_id: &str) -> BreakerState {
        let mut entries = self.entries.lock().expect("circuit breaker lock poisoned");
        let entry = entries.entry(backend_id.to_string()).or_default();
        Self::effective_state(entry)
    }

    fn effective_state(entry: &mut BreakerEntry) -> BreakerState {
        match entry.open_until_ts {
            None => BreakerState::Closed,
            Some(open_until) => {
                if now_s() >= open_until {
                    if !entry.half_open_probe_in_flight {
                        entry.half_open_probe_in_flight = true;
                        BreakerState::HalfOpen
                    } else {
                        // A probe is already outstanding; keep reporting open
                        // so concurrent callers don't pile onto the same probe.
                        BreakerState::Open
                    }
                } else {
                    BreakerState::Open
                }
            }
        }
    }

    /// Whether `backend_id` should currently be skipped.
    pub fn is_open(&self, backend_id: &str) -> bool {
        matches!(self.state(backend_id), BreakerState::Open)
    }

    /// Record a failed attempt against `backend_id`, possibly tripping
    /// or re-opening the breaker.
    pub fn record_failure(&self, backend_id: &str, reason: impl Into<String>) {
        let mut entries = self.entries.lock().expect("circuit breaker lock poisoned");
        let entry = entries.entry(backend_id.to_string()).or_default();
        entry.last_reason = Some(reason.into());

        let was_half_open = entry.half_open_probe_in_flight;
        entry.half_open_probe_in_flight = false;

        if was_half_open {
            // Half-open probe failed: re-open with doubled cooldown.
            entry.cooldown_s = (entry.cooldown_s * 2).min(MAX_COOLDOWN_S);
            entry.open_until_ts = Some(now_s() + entry.cooldown_s);
            entry.failure_count = FAILURE_THRESHOLD;
            return;
        }

        entry.failure_count += 1;
        if entry.failure_count >= FAILURE_THRESHOLD && entry.open_until_ts.is_none() {
            entry.cooldown_s = BASE_COOLDOWN_S;
            entry.open_until_ts = Some(now_s() + entry.cooldown_s);
        }
    }

    /// Record a successful attempt, resetting the breaker to closed.
    pub fn record_success(&self, backend_id: &str) {
        let mut entries = self.entries.lock().expect("circuit breaker lock poisoned");
        entries.insert(backend_id.to_string(), BreakerEntry::default());
    }

    pub fn last_reason(&self, backend_id: &str) -> Option<String> {
        let entries = self.entries.lock().expect("circuit breaker lock poisoned");
        entries.get(backend_id).and_then(|e| e.last_reason.clone())
    }

    pub fn reset(&self) {
        self.entries.lock().expect("circuit breaker lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let registry = CircuitBreakerRegistry::new();
        assert_eq!(registry.state("backend-a"), BreakerState::Closed);
        assert!(!registry.is_open("backend-a"));
    }

    #[test]
    fn opens_after_two_consecutive_failures() {
        let registry = CircuitBreakerRegistry::new();
        registry.record_failure("backend-a", "timeout");
        assert_eq!(registry.state("backend-a"), BreakerState::Closed);
        registry.record_failure("backend-a", "timeout");
        assert!(registry.is_open("backend-a"));
    }

    #[test]
    fn success_resets_the_breaker() {
        let registry = CircuitBreakerRegistry::new();
        registry.record_failure("backend-a", "timeout");
        registry.record_failure("backend-a", "timeout");
        assert!(registry.is_open("backend-a"));
        registry.record_success("backend-a");
        assert_eq!(registry.state("backend-a"), BreakerState::Closed);
    }

    #[test]
    fn reset_clears_all_entries() {
        let registry = CircuitBreakerRegistry::new();
        registry.record_failure("backend-a", "timeout");
        registry.record_failure("backend-a", "timeout");
        registry.reset();
        assert_eq!(registry.state("backend-a"), BreakerState::Closed);
    }

    #[test]
    fn independent_backends_track_separately() {
        let registry = CircuitBreakerRegistry::new();
        registry.record_failure("backend-a", "timeout");
        registry.record_failure("backend-a", "timeout");
        assert!(registry.is_open("backend-a"));
        assert!(!registry.is_open("backend-b"));
    }
}
