//! Background completion
//!
//! Detection can hand its upload/persist/notify step back to the caller as a
//! [`BackgroundTask`] value. The HTTP layer submits those values to a
//! [`BackgroundExecutor`], which drains them from a bounded channel and runs
//! them outside the request path.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CompletionError;
use crate::storage::{DetectionStore, ImageUploader};

use super::notification::Notifier;
use super::types::DetectionResponse;

/// Deferred completion work produced by a detection
pub enum BackgroundTask {
    /// Guests: nothing to upload, persist or notify
    Noop,
    Complete(Box<CompletionJob>),
}

impl BackgroundTask {
    pub fn is_noop(&self) -> bool {
        matches!(self, BackgroundTask::Noop)
    }

    /// Run to completion; never fails
    pub async fn run(self) {
        match self {
            BackgroundTask::Noop => {}
            BackgroundTask::Complete(job) => job.run().await,
        }
    }
}

impl std::fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackgroundTask::Noop => f.write_str("Noop"),
            BackgroundTask::Complete(job) => f
                .debug_tuple("Complete")
                .field(&job.response.detection_id)
                .finish(),
        }
    }
}

/// Upload → persist → notify for one registered user's detection
///
/// Owns the response outright; `image_url` is filled in at most once, right
/// before the response is persisted.
pub struct CompletionJob {
    response: DetectionResponse,
    data: Bytes,
    uploader: Arc<dyn ImageUploader>,
    store: Arc<dyn DetectionStore>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl CompletionJob {
    pub fn new(
        response: DetectionResponse,
        data: Bytes,
        uploader: Arc<dyn ImageUploader>,
        store: Arc<dyn DetectionStore>,
        notifier: Arc<dyn Notifier>,
        timeout: Duration,
    ) -> Self {
        Self {
            response,
            data,
            uploader,
            store,
            notifier,
            timeout,
        }
    }

    /// Exactly one of `notify_done` / `notify_failed` is sent, whatever happens
    ///
    /// The deadline covers upload and persist together, and `notify_done` is
    /// only sent once the store has confirmed the save. A store that commits
    /// but has not returned when the deadline passes is reported as failed, so
    /// a failed notification means "not confirmed in time" and the record may
    /// still be present in history.
    pub async fn run(self) {
        let detection_id = self.response.detection_id.clone();
        let notifier = self.notifier.clone();
        let timeout = self.timeout;

        let mut handle = tokio::spawn(self.complete());
        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(CompletionError::Aborted(join_err.to_string())),
            Err(_) => {
                handle.abort();
                Err(CompletionError::TimedOut(timeout.as_millis() as u64))
            }
        };

        match outcome {
            Ok(()) => {
                debug!("Background completion finished for {}", detection_id);
                notifier.notify_done(&detection_id);
            }
            Err(e) => {
                warn!("Background completion failed for {}: {}", detection_id, e);
                notifier.notify_failed(&detection_id);
            }
        }
    }

    async fn complete(self) -> Result<(), CompletionError> {
        let CompletionJob {
            mut response,
            data,
            uploader,
            store,
            ..
        } = self;

        let url = uploader
            .upload(&data, &response.detection_id)
            .await
            .map_err(CompletionError::Upload)?;
        response.image_url = Some(url);

        store
            .save_detection(&response)
            .await
            .map_err(CompletionError::Persist)
    }
}

/// Runs submitted background tasks with bounded concurrency
#[derive(Clone)]
pub struct BackgroundExecutor {
    tx: mpsc::Sender<BackgroundTask>,
}

impl BackgroundExecutor {
    /// Start the executor loop on the current runtime
    ///
    /// The loop exits once every executor handle has been dropped and the
    /// queue is drained.
    pub fn start(queue_capacity: usize, max_concurrent: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let handle = tokio::spawn(run_executor_loop(rx, max_concurrent.max(1)));
        (Self { tx }, handle)
    }

    /// Queue a task; a full or closed queue runs it on a fresh task instead
    pub fn submit(&self, task: BackgroundTask) {
        if task.is_noop() {
            return;
        }

        match self.tx.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!("Background queue full, running task directly");
                tokio::spawn(task.run());
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                warn!("Background executor stopped, running task directly");
                tokio::spawn(task.run());
            }
        }
    }

    pub fn submit_all(&self, tasks: impl IntoIterator<Item = BackgroundTask>) {
        for task in tasks {
            self.submit(task);
        }
    }
}

async fn run_executor_loop(mut rx: mpsc::Receiver<BackgroundTask>, max_concurrent: usize) {
    info!("Starting background completion loop ({} concurrent)", max_concurrent);
    let permits = Arc::new(Semaphore::new(max_concurrent));
    let mut running = Vec::new();

    while let Some(task) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        running.retain(|h: &JoinHandle<()>| !h.is_finished());
        running.push(tokio::spawn(async move {
            task.run().await;
            drop(permit);
        }));
    }

    for handle in running {
        let _ = handle.await;
    }
    info!("Background completion loop stopped");
}
