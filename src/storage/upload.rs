//! Local-disk image uploader
//!
//! Writes originals under the upload directory; the HTTP layer serves that
//! directory statically under `public_base`.

use std::path::PathBuf;

use async_trait::async_trait;
use anyhow::{Context, Result};
use tracing::debug;

use crate::config::UploadConfig;
use crate::utils::image::sniff_extension;

use super::traits::ImageUploader;

pub struct LocalUploader {
    dir: PathBuf,
    public_base: String,
}

impl LocalUploader {
    pub fn new(dir: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            public_base: public_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(&config.dir, config.public_base.clone())
    }
}

#[async_trait]
impl ImageUploader for LocalUploader {
    async fn upload(&self, data: &[u8], detection_id: &str) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create upload dir {:?}", self.dir))?;

        let filename = format!("{}.{}", detection_id, sniff_extension(data));
        let path = self.dir.join(&filename);
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;

        debug!("Uploaded image to {:?}", path);
        Ok(format!("{}/{}", self.public_base, filename))
    }
}
