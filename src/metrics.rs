// Batch telemetry and adjustment-event recording, adapted from the
// teacher's generic metrics collector shape.

#![allow(clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One HTTP round-trip's worth of telemetry.
#[derive(Debug, Clone)]
pub struct BatchTelemetry {
    pub tile_ids: Vec<String>,
    pub latency_ms: u64,
    pub http_status: u16,
    pub request_id: Option<String>,
    pub payload_bytes: usize,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RequestCounts {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
}

/// Accumulates batch telemetry and request counters for a single
/// `submit_tiles` invocation.
pub struct MetricsCollector {
    requests: Arc<Mutex<RequestCounts>>,
    batches: Arc<Mutex<VecDeque<BatchTelemetry>>>,
    max_samples: usize,
}

impl MetricsCollector {
    pub fn new(max_samples: usize) -> Self {
        Self {
            requests: Arc::new(Mutex::new(RequestCounts::default())),
            batches: Arc::new(Mutex::new(VecDeque::with_capacity(max_samples))),
            max_samples,
        }
    }

    pub fn record_request(&self, success: bool) {
        let mut counts = self.requests.lock().expect("metrics mutex poisoned");
        counts.total += 1;
        if success {
            counts.success += 1;
        } else {
            counts.failure += 1;
        }
    }

    pub fn record_batch(&self, telemetry: BatchTelemetry) {
        let mut batches = self.batches.lock().expect("metrics mutex poisoned");
        batches.push_back(telemetry);
        if batches.len() > self.max_samples {
            batches.pop_front();
        }
    }

    pub fn request_counts(&self) -> RequestCounts {
        self.requests.lock().expect("metrics mutex poisoned").clone()
    }

    pub fn batches(&self) -> Vec<BatchTelemetry> {
        self.batches.lock().expect("metrics mutex poisoned").iter().cloned().collect()
    }

    pub fn reset(&self) {
        *self.requests.lock().expect("metrics mutex poisoned") = RequestCounts::default();
        self.batches.lock().expect("metrics mutex poisoned").clear();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Measures wall-clock duration of one batch attempt and records it
/// against a collector on completion.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_are_capped_at_max_samples() {
        let collector = MetricsCollector::new(2);
        for i in 0..5 {
            collector.record_batch(BatchTelemetry {
                tile_ids: vec![format!("t{i}")],
                latency_ms: 10,
                http_status: 200,
                request_id: None,
                payload_bytes: 100,
                attempts: 1,
            });
        }
        assert_eq!(collector.batches().len(), 2);
    }

    #[test]
    fn request_counts_track_success_and_failure() {
        let collector = MetricsCollector::default();
        collector.record_request(true);
        collector.record_request(false);
        let counts = collector.request_counts();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.success, 1);
        assert_eq!(counts.failure, 1);
    }
}
