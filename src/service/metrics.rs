//! Detection metrics
//!
//! Process-wide counters exposed on `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

pub struct DetectionMetrics {
    /// Face-detection accuracy of the most recent image: 0 or 100
    accuracy: AtomicU64,
    requests: AtomicU64,
    degraded: AtomicU64,
    faces: AtomicU64,
    started_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub face_detection_accuracy: f64,
    pub detection_requests_total: u64,
    pub degraded_inferences_total: u64,
    pub faces_detected_total: u64,
    pub uptime_seconds: u64,
}

impl DetectionMetrics {
    pub fn new() -> Self {
        Self {
            accuracy: AtomicU64::new(0f64.to_bits()),
            requests: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            faces: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_faces(&self, count: usize) {
        self.faces.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn set_accuracy(&self, value: f64) {
        self.accuracy.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn accuracy(&self) -> f64 {
        f64::from_bits(self.accuracy.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            face_detection_accuracy: self.accuracy(),
            detection_requests_total: self.requests.load(Ordering::Relaxed),
            degraded_inferences_total: self.degraded.load(Ordering::Relaxed),
            faces_detected_total: self.faces.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for DetectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
