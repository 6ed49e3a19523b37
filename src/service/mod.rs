//! Service layer module

pub mod background;
pub mod batch;
pub mod detection_service;
pub mod metrics;
pub mod notification;
pub mod types;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;

pub use background::{BackgroundExecutor, BackgroundTask, CompletionJob};
pub use batch::BatchScheduler;
pub use detection_service::{DetectionService, PipelineTimeouts};
pub use metrics::DetectionMetrics;
pub use notification::{NotificationBoard, Notifier, ProcessingStatus};
pub use types::*;
pub use validator::{validate_image, MAX_FILE_SIZE};
