//! Batch scheduler
//!
//! Fans a list of images out to independent detection tasks, at most
//! `min(8, max_batch_size)` running at once, and collects their results in
//! completion order. A failing or panicking item only affects its own entry.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::error::DetectionError;
use crate::storage::DetectionStore;

use super::detection_service::DetectionService;
use super::types::*;

/// Hard cap on concurrent pipeline runs within one batch
pub const MAX_BATCH_WORKERS: usize = 8;

pub struct BatchScheduler<S: DetectionStore> {
    service: Arc<DetectionService<S>>,
    max_batch_size: usize,
}

impl<S: DetectionStore> BatchScheduler<S> {
    pub fn new(service: Arc<DetectionService<S>>, max_batch_size: usize) -> Self {
        Self {
            service,
            max_batch_size,
        }
    }

    /// Largest accepted batch
    pub fn batch_limit(&self) -> usize {
        self.max_batch_size * 3
    }

    pub fn worker_limit(&self) -> usize {
        self.max_batch_size.clamp(1, MAX_BATCH_WORKERS)
    }

    /// Run every file through the detection pipeline
    ///
    /// Only an oversized batch fails as a whole, and it does so before any
    /// pipeline runs. Items are validated with the permissive content-type rule.
    pub async fn run_batch(
        &self,
        files: Vec<RawImage>,
        user: &User,
        completion: CompletionMode,
    ) -> Result<BatchOutcome, DetectionError> {
        let limit = self.batch_limit();
        if files.len() > limit {
            return Err(DetectionError::BatchTooLarge {
                limit,
                received: files.len(),
            });
        }

        let total = files.len();
        let permits = Arc::new(Semaphore::new(self.worker_limit()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = DetectOptions {
            completion,
            permissive_content_type: true,
        };

        for (index, image) in files.into_iter().enumerate() {
            let service = self.service.clone();
            let permits = permits.clone();
            let tx = tx.clone();
            let user = user.clone();

            tokio::spawn(async move {
                let filename = image.filename.clone();
                let _permit = permits.acquire_owned().await;

                let result = tokio::spawn(async move { service.detect(&image, &user, options).await })
                    .await
                    .unwrap_or_else(|join_err| {
                        Err(DetectionError::Internal(format!(
                            "Batch worker failed unexpectedly: {}",
                            join_err
                        )))
                    });

                let _ = tx.send((index, filename, result));
            });
        }
        drop(tx);

        let mut outcome = BatchOutcome::default();
        while let Some((index, filename, result)) = rx.recv().await {
            match result {
                Ok(DetectionOutcome { response, task }) => {
                    outcome.background_tasks.extend(task);
                    outcome.results.push(BatchEntry::Success {
                        index,
                        filename,
                        response,
                    });
                }
                Err(e) => {
                    warn!("Batch item {} ({:?}) failed: {}", index, filename, e);
                    outcome.results.push(BatchEntry::Failure(BatchFailure {
                        index,
                        filename,
                        error: e.to_string(),
                        code: e.code().to_string(),
                    }));
                }
            }
        }

        let failed = outcome.results.iter().filter(|r| r.is_failure()).count();
        info!(
            "Batch for {}: {} item(s), {} failed, {} background task(s)",
            user.user_id,
            total,
            failed,
            outcome.background_tasks.len()
        );

        Ok(outcome)
    }
}
