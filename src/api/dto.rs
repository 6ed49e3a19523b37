//! REST API request/response data transfer objects

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::service::notification::ProcessingStatus;
use crate::service::types::BatchEntry;

/// `?background=true` moves upload/persistence off the request path
#[derive(Debug, Default, Deserialize)]
pub struct DetectQuery {
    #[serde(default)]
    pub background: bool,
}

/// History pagination; `offset` is accepted as a synonym for `skip`
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub skip: Option<i64>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl HistoryQuery {
    /// `skip` wins when both are given
    pub fn skip(&self) -> i64 {
        self.skip.or(self.offset).unwrap_or(0).max(0)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(10).clamp(1, 100)
    }
}

/// Batch detect response
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchEntry>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchResponse {
    pub fn new(results: Vec<BatchEntry>) -> Self {
        let failed = results.iter().filter(|r| r.is_failure()).count();
        Self {
            total: results.len(),
            succeeded: results.len() - failed,
            failed,
            results,
        }
    }
}

/// Background completion status
#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    pub detection_id: String,
    pub status: ProcessingStatus,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub models_loaded: HashMap<String, bool>,
}

/// Metrics response
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub face_detection_accuracy: f64,
    pub detection_requests_total: u64,
    pub degraded_inferences_total: u64,
    pub faces_detected_total: u64,
    pub stored_detections: i64,
    pub pending_notifications: usize,
    pub uptime_seconds: u64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            code: code.to_string(),
        }
    }
}
