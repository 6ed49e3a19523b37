//! Emotion detection service configuration

use serde::Deserialize;
use std::path::PathBuf;

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "EMOFACE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub models: ModelsConfig,
    pub detection: DetectionConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub background: BackgroundConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub rest_port: u16,
    /// Request body limit; derived from the batch limit when unset
    pub body_limit_mb: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    pub device: String,
    /// Seconds before an unused model is unloaded, 0 keeps models resident
    pub model_idle_timeout: u64,
    /// Upper bound on locate + classify for one image
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub detector: PathBuf,
    pub emotion: PathBuf,
    /// Overrides the classifier's own label map
    pub emotion_labels: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    pub max_batch_size: usize,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: String,
    pub sqlite_path: Option<PathBuf>,
    /// Upper bound on one synchronous save
    #[serde(default = "default_storage_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_storage_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub dir: PathBuf,
    pub public_base: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackgroundConfig {
    pub queue_capacity: usize,
    pub max_concurrent: usize,
    pub task_timeout_ms: u64,
    pub notification_ttl_secs: u64,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> String {
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.toml".to_string())
    }

    /// Largest number of images accepted in one batch request
    pub fn batch_limit(&self) -> usize {
        self.detection.max_batch_size * 3
    }

    /// Request body limit in bytes, large enough for a full batch
    pub fn body_limit_bytes(&self) -> usize {
        match self.server.body_limit_mb {
            Some(mb) => mb * 1024 * 1024,
            None => self.batch_limit().max(1) * crate::service::validator::MAX_FILE_SIZE + 1024 * 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            inference: InferenceConfig::default(),
            models: ModelsConfig::default(),
            detection: DetectionConfig::default(),
            storage: StorageConfig::default(),
            upload: UploadConfig::default(),
            background: BackgroundConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rest_port: 8000,
            body_limit_mb: None,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: "CPU".to_string(),
            model_idle_timeout: 0,
            timeout_ms: 30_000,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            detector: PathBuf::from("models/scrfd_10g_kps.onnx"),
            emotion: PathBuf::from("models/emotion_ferplus.onnx"),
            emotion_labels: None,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            confidence_threshold: 0.5,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "sqlite".to_string(),
            sqlite_path: Some(PathBuf::from("data/detections.db")),
            timeout_ms: default_storage_timeout_ms(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/uploads"),
            public_base: "/data/uploads".to_string(),
            timeout_ms: 15_000,
        }
    }
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_concurrent: 4,
            task_timeout_ms: 60_000,
            notification_ttl_secs: 300,
        }
    }
}
