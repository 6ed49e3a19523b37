//! Completion notifications
//!
//! Background tasks report their outcome here; clients poll
//! `/api/v1/notifications/:detection_id` to learn whether the upload and
//! persistence finished.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Receives the final outcome of a background completion
///
/// Implementations must not fail; delivery problems are theirs to swallow.
pub trait Notifier: Send + Sync + 'static {
    fn notify_done(&self, detection_id: &str);
    fn notify_failed(&self, detection_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Done,
    Failed,
}

/// In-memory notification store with a fixed time-to-live
pub struct NotificationBoard {
    entries: Mutex<HashMap<String, (ProcessingStatus, Instant)>>,
    ttl: Duration,
}

impl NotificationBoard {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Status for `detection_id`
    ///
    /// Unknown or expired ids report `Done`: anything older than the TTL is
    /// assumed to have finished.
    pub fn status(&self, detection_id: &str) -> ProcessingStatus {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries, self.ttl);
        entries
            .get(detection_id)
            .map(|(status, _)| *status)
            .unwrap_or(ProcessingStatus::Done)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, detection_id: &str, status: ProcessingStatus) {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries, self.ttl);
        entries.insert(detection_id.to_string(), (status, Instant::now()));
        debug!("Notification {:?} for {}", status, detection_id);
    }

    fn sweep(entries: &mut HashMap<String, (ProcessingStatus, Instant)>, ttl: Duration) {
        entries.retain(|_, (_, recorded_at)| recorded_at.elapsed() < ttl);
    }
}

impl Default for NotificationBoard {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}

impl Notifier for NotificationBoard {
    fn notify_done(&self, detection_id: &str) {
        self.record(detection_id, ProcessingStatus::Done);
    }

    fn notify_failed(&self, detection_id: &str) {
        self.record(detection_id, ProcessingStatus::Failed);
    }
}
