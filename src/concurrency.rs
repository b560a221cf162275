// Adaptive concurrency controller (AIMD).

use std::time::Duration;

/// Outcome of one completed batch attempt, as observed by the
/// controller.
#[derive(Debug, Clone, Copy)]
pub struct BatchOutcome {
    pub http_status: u16,
    pub latency: Duration,
    pub attempts: u32,
}

/// One limit adjustment, recorded for manifest-level telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentEvent {
    pub previous_limit: usize,
    pub new_limit: usize,
    pub reason: &'static str,
}

/// Additive-increase/multiplicative-decrease in-flight limit
/// controller, bounded to `[min_concurrency, max_concurrency]`.
pub struct ConcurrencyController {
    min: usize,
    max: usize,
    latency_target: Duration,
    current: usize,
    peak: usize,
    events: Vec<AdjustmentEvent>,
}

impl ConcurrencyController {
    pub fn new(min: usize, max: usize, latency_target: Duration) -> Self {
        let start = min.max(1);
        Self {
            min: min.max(1),
            max: max.max(start),
            latency_target,
            current: start,
            peak: start,
            events: Vec::new(),
        }
    }

    pub fn current_limit(&self) -> usize {
        self.current
    }

    pub fn peak_limit(&self) -> usize {
        self.peak
    }

    pub fn final_limit(&self) -> usize {
        self.current
    }

    pub fn events(&self) -> &[AdjustmentEvent] {
        &self.events
    }

    /// Apply one batch outcome, adjusting the in-flight limit.
    pub fn record(&mut self, outcome: BatchOutcome) {
        let reason = if outcome.http_status >= 500 {
            self.decrease("http-5xx")
        } else if outcome.latency > self.latency_target {
            self.decrease("latency-high")
        } else if outcome.attempts > 1 {
            self.decrease_by_one("retries")
        } else {
            self.increase("healthy")
        };
        let _ = reason;
        self.peak = self.peak.max(self.current);
    }

    fn increase(&mut self, reason: &'static str) -> &'static str {
        let previous = self.current;
        self.current = (self.current + 1).min(self.max);
        self.push_event(previous, reason);
        reason
    }

    fn decrease(&mut self, reason: &'static str) -> &'static str {
        let previous = self.current;
        let halved = (self.current as f64 / 2.0).ceil() as usize;
        self.current = halved.max(self.min);
        self.push_event(previous, reason);
        reason
    }

    fn decrease_by_one(&mut self, reason: &'static str) -> &'static str {
        let previous = self.current;
        self.current = self.current.saturating_sub(1).max(self.min);
        self.push_event(previous, reason);
        reason
    }

    fn push_event(&mut self, previous: usize, reason: &'static str) {
        if previous != self.current {
            self.events.push(AdjustmentEvent {
                previous_limit: previous,
                new_limit: self.current,
                reason,
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn outcome(status: u16, latency_ms: u64, attempts: u32) -> BatchOutcome {
        BatchOutcome {
            http_status: status,
            latency: Duration::from_millis(latency_ms),
            attempts,
        }
    }

    #[test]
    fn healthy_batches_increase_the_limit_additively() {
        let mut controller = ConcurrencyController::new(1, 8, Duration::from_millis(2000));
        controller.record(outcome(200, 500, 1));
        controller.record(outcome(200, 500, 1));
        assert_eq!(controller.current_limit(), 3);
        assert_eq!(controller.peak_limit(), 3);
    }

    #[test]
    fn http_5xx_halves_the_limit() {
        let mut controller = ConcurrencyController::new(1, 8, Duration::from_millis(2000));
        for _ in 0..3 {
            controller.record(outcome(200, 500, 1));
        }
        assert_eq!(controller.current_limit(), 4);
        controller.record(outcome(500, 500, 1));
        assert_eq!(controller.current_limit(), 2);
        assert_eq!(controller.events().last().unwrap().reason, "http-5xx");
    }

    #[test]
    fn latency_spike_halves_the_limit() {
        let mut controller = ConcurrencyController::new(1, 8, Duration::from_millis(100));
        for _ in 0..3 {
            controller.record(outcome(200, 50, 1));
        }
        assert_eq!(controller.current_limit(), 4);
        controller.record(outcome(200, 500, 1));
        assert_eq!(controller.current_limit(), 2);
        assert_eq!(controller.events().last().unwrap().reason, "latency-high");
    }

    #[test]
    fn retries_decrease_by_one() {
        let mut controller = ConcurrencyController::new(1, 8, Duration::from_millis(2000));
        for _ in 0..3 {
            controller.record(outcome(200, 500, 1));
        }
        assert_eq!(controller.current_limit(), 4);
        controller.record(outcome(200, 500, 2));
        assert_eq!(controller.current_limit(), 3);
    }

    #[test]
    fn limit_never_drops_below_minimum() {
        let mut controller = ConcurrencyController::new(2, 8, Duration::from_millis(2000));
        for _ in 0..5 {
            controller.record(outcome(500, 500, 1));
        }
        assert_eq!(controller.current_limit(), 2);
    }
}
