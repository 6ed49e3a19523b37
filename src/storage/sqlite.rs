//! SQLite storage implementation

use std::path::Path;

use async_trait::async_trait;
use chrono::DateTime;
use sqlx::{sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow}, Row};
use anyhow::{Result, Context};
use tracing::{info, debug};

use crate::service::types::{DetectionResponse, DetectionResult};

use super::traits::DetectionStore;

/// SQLite-based detection storage
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage
    pub async fn new(db_path: &str) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .context("Failed to connect to SQLite database")?;

        let storage = Self { pool };
        storage.initialize().await?;

        Ok(storage)
    }

    /// Initialize database schema
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS detections (
                detection_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                image_url TEXT,
                results_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_detections_user ON detections(user_id, created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite database initialized");
        Ok(())
    }

    fn row_to_detection(row: &SqliteRow) -> Result<DetectionResponse> {
        let results_json: String = row.get("results_json");
        let detection_results: DetectionResult =
            serde_json::from_str(&results_json).context("Corrupt results_json column")?;
        let created_at: i64 = row.get("created_at");

        Ok(DetectionResponse {
            detection_id: row.get("detection_id"),
            user_id: row.get("user_id"),
            timestamp: DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
            image_url: row.get("image_url"),
            detection_results,
        })
    }
}

#[async_trait]
impl DetectionStore for SqliteStorage {
    async fn save_detection(&self, detection: &DetectionResponse) -> Result<()> {
        let results_json = serde_json::to_string(&detection.detection_results)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO detections (detection_id, user_id, image_url, results_json, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&detection.detection_id)
        .bind(&detection.user_id)
        .bind(&detection.image_url)
        .bind(results_json)
        .bind(detection.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!("Saved detection: {}", detection.detection_id);
        Ok(())
    }

    async fn get_detection(&self, detection_id: &str) -> Result<Option<DetectionResponse>> {
        let row = sqlx::query(
            r#"
            SELECT detection_id, user_id, image_url, results_json, created_at
            FROM detections
            WHERE detection_id = ?
            "#,
        )
        .bind(detection_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_detection).transpose()
    }

    async fn list_detections(&self, user_id: &str, offset: i64, limit: i64) -> Result<Vec<DetectionResponse>> {
        let rows = sqlx::query(
            r#"
            SELECT detection_id, user_id, image_url, results_json, created_at
            FROM detections
            WHERE user_id = ?
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_detection).collect()
    }

    async fn delete_detection(&self, detection_id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM detections WHERE detection_id = ? AND user_id = ?")
            .bind(detection_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_detections(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM detections")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("count"))
    }
}
