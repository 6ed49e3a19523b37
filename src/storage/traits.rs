//! Storage abstraction traits
//!
//! Defines the interfaces for detection persistence and image upload.
//! Implementations can be swapped between SQLite and in-memory.

use async_trait::async_trait;
use anyhow::Result;

use crate::service::types::DetectionResponse;

/// Detection history storage
/// Implementations must be thread-safe and async-compatible
#[async_trait]
pub trait DetectionStore: Send + Sync + 'static {
    /// Save a completed detection
    async fn save_detection(&self, detection: &DetectionResponse) -> Result<()>;

    /// Get a detection by ID
    async fn get_detection(&self, detection_id: &str) -> Result<Option<DetectionResponse>>;

    /// List a user's detections, newest first
    async fn list_detections(&self, user_id: &str, offset: i64, limit: i64) -> Result<Vec<DetectionResponse>>;

    /// Delete a detection owned by `user_id`
    async fn delete_detection(&self, detection_id: &str, user_id: &str) -> Result<bool>;

    /// Get total detection count
    async fn count_detections(&self) -> Result<i64>;
}

/// Stores original image bytes and returns a public URL
#[async_trait]
pub trait ImageUploader: Send + Sync + 'static {
    async fn upload(&self, data: &[u8], detection_id: &str) -> Result<String>;
}
