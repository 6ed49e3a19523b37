//! In-memory storage implementation
//!
//! Used when `storage.type = "memory"` and by tests. Contents are lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use anyhow::Result;
use parking_lot::RwLock;

use crate::service::types::DetectionResponse;

use super::traits::DetectionStore;

#[derive(Default)]
pub struct MemoryStorage {
    detections: RwLock<HashMap<String, DetectionResponse>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DetectionStore for MemoryStorage {
    async fn save_detection(&self, detection: &DetectionResponse) -> Result<()> {
        self.detections
            .write()
            .insert(detection.detection_id.clone(), detection.clone());
        Ok(())
    }

    async fn get_detection(&self, detection_id: &str) -> Result<Option<DetectionResponse>> {
        Ok(self.detections.read().get(detection_id).cloned())
    }

    async fn list_detections(&self, user_id: &str, offset: i64, limit: i64) -> Result<Vec<DetectionResponse>> {
        let mut owned: Vec<DetectionResponse> = self
            .detections
            .read()
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();

        owned.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(owned
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn delete_detection(&self, detection_id: &str, user_id: &str) -> Result<bool> {
        let mut detections = self.detections.write();
        match detections.get(detection_id) {
            Some(d) if d.user_id == user_id => {
                detections.remove(detection_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_detections(&self) -> Result<i64> {
        Ok(self.detections.read().len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::service::types::DetectionResult;

    fn detection(id: &str, user: &str, offset_secs: i64) -> DetectionResponse {
        DetectionResponse {
            detection_id: id.to_string(),
            user_id: user.to_string(),
            timestamp: Utc::now() + Duration::seconds(offset_secs),
            image_url: None,
            detection_results: DetectionResult::new(Vec::new(), 0.01),
        }
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();
        storage.save_detection(&detection("a", "u1", -10)).await.unwrap();
        storage.save_detection(&detection("b", "u1", 0)).await.unwrap();
        storage.save_detection(&detection("c", "u2", 0)).await.unwrap();

        assert_eq!(storage.count_detections().await.unwrap(), 3);

        let listed = storage.list_detections("u1", 0, 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].detection_id, "b");

        assert!(!storage.delete_detection("c", "u1").await.unwrap());
        assert!(storage.delete_detection("c", "u2").await.unwrap());
        assert!(storage.get_detection("c").await.unwrap().is_none());
    }
}
