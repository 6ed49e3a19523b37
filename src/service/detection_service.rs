//! Detection Service - Core business logic
//!
//! Runs the single-image pipeline: validate, decode, locate faces, classify,
//! rank, then either complete synchronously or hand back a background task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use bytes::Bytes;
use chrono::Utc;
use image::RgbImage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::{
    preprocess::{crop_faces, decode_image},
    ranking::rank_emotions,
    LabelMap, ModelResources,
};
use crate::error::{CompletionError, DetectionError};
use crate::storage::{DetectionStore, ImageUploader};

use super::background::{BackgroundTask, CompletionJob};
use super::metrics::DetectionMetrics;
use super::notification::Notifier;
use super::types::*;
use super::validator::validate_image;

/// Time limits applied around the pipeline's slow steps
#[derive(Debug, Clone, Copy)]
pub struct PipelineTimeouts {
    pub inference: Duration,
    pub upload: Duration,
    pub persist: Duration,
    pub background_task: Duration,
}

impl PipelineTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            inference: Duration::from_millis(config.inference.timeout_ms),
            upload: Duration::from_millis(config.upload.timeout_ms),
            persist: Duration::from_millis(config.storage.timeout_ms),
            background_task: Duration::from_millis(config.background.task_timeout_ms),
        }
    }
}

impl Default for PipelineTimeouts {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Emotion detection service
pub struct DetectionService<S: DetectionStore> {
    resources: Arc<ModelResources>,
    storage: Arc<S>,
    uploader: Arc<dyn ImageUploader>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<DetectionMetrics>,
    timeouts: PipelineTimeouts,
}

impl<S: DetectionStore> DetectionService<S> {
    /// Create a new detection service
    pub fn new(
        resources: Arc<ModelResources>,
        storage: Arc<S>,
        uploader: Arc<dyn ImageUploader>,
        notifier: Arc<dyn Notifier>,
        timeouts: PipelineTimeouts,
    ) -> Self {
        Self {
            resources,
            storage,
            uploader,
            notifier,
            metrics: Arc::new(DetectionMetrics::new()),
            timeouts,
        }
    }

    /// Get a reference to the storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn metrics(&self) -> &DetectionMetrics {
        &self.metrics
    }

    /// Detect faces and emotions in one image
    ///
    /// Only validation, decode and internal worker failures are returned as
    /// errors. Inference faults degrade to an empty result and completion
    /// faults are logged (synchronous) or notified (background).
    pub async fn detect(
        &self,
        image: &RawImage,
        user: &User,
        options: DetectOptions,
    ) -> Result<DetectionOutcome, DetectionError> {
        let start = Instant::now();
        self.metrics.record_request();

        let data = validate_image(image, options.permissive_content_type)?;
        let decoded = self.decode(image.display_name(), data.clone()).await?;
        debug!("Decoded {} ({}x{})", image.display_name(), decoded.width(), decoded.height());

        let outcome = self.infer(decoded).await;
        let faces = self.record_outcome(image.display_name(), outcome);

        let response = DetectionResponse {
            detection_id: Uuid::new_v4().to_string(),
            user_id: user.user_id.clone(),
            timestamp: Utc::now(),
            image_url: None,
            detection_results: DetectionResult::new(faces, start.elapsed().as_secs_f64()),
        };

        info!(
            "Detection {} for {}: {} face(s) in {:.3}s",
            response.detection_id,
            user.user_id,
            response.detection_results.faces.len(),
            response.detection_results.processing_time
        );

        match options.completion {
            CompletionMode::Synchronous => {
                let response = self.complete_now(response, &data, user).await;
                Ok(DetectionOutcome { response, task: None })
            }
            CompletionMode::Background => {
                let task = self.background_task(response.clone(), data, user);
                Ok(DetectionOutcome {
                    response,
                    task: Some(task),
                })
            }
        }
    }

    /// Decode on the blocking pool
    async fn decode(&self, filename: &str, data: Bytes) -> Result<RgbImage, DetectionError> {
        match tokio::task::spawn_blocking(move || decode_image(&data)).await {
            Ok(Ok(image)) => Ok(image),
            Ok(Err(e)) => Err(DetectionError::Decode {
                filename: filename.to_string(),
                message: e.to_string(),
            }),
            Err(join_err) => {
                error!("Decode worker failed for {}: {}", filename, join_err);
                Err(DetectionError::Internal(format!(
                    "Image decoding failed unexpectedly: {}",
                    join_err
                )))
            }
        }
    }

    /// Locate and classify on the blocking pool, bounded by the inference timeout
    async fn infer(&self, image: RgbImage) -> InferenceOutcome {
        let resources = self.resources.clone();
        let worker = tokio::task::spawn_blocking(move || run_inference(&resources, &image));

        match tokio::time::timeout(self.timeouts.inference, worker).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(e))) => InferenceOutcome::Degraded {
                reason: format!("{:#}", e),
            },
            Ok(Err(join_err)) => InferenceOutcome::Degraded {
                reason: format!("inference worker aborted: {}", join_err),
            },
            Err(_) => InferenceOutcome::Degraded {
                reason: format!(
                    "inference timed out after {}ms",
                    self.timeouts.inference.as_millis()
                ),
            },
        }
    }

    fn record_outcome(&self, filename: &str, outcome: InferenceOutcome) -> Vec<FaceDetection> {
        match &outcome {
            InferenceOutcome::Faces(faces) => {
                self.metrics.set_accuracy(100.0);
                self.metrics.record_faces(faces.len());
            }
            InferenceOutcome::NoFaces => {
                debug!("No faces found in {}", filename);
                self.metrics.set_accuracy(0.0);
            }
            InferenceOutcome::Degraded { reason } => {
                warn!("Inference degraded for {}: {}", filename, reason);
                self.metrics.set_accuracy(0.0);
                self.metrics.record_degraded();
            }
        }
        outcome.into_faces()
    }

    /// Upload and persist before returning; guests skip both
    async fn complete_now(&self, mut response: DetectionResponse, data: &Bytes, user: &User) -> DetectionResponse {
        if user.is_guest {
            debug!("Guest {}: skipping upload and persistence", user.user_id);
            return response;
        }

        let upload = self.uploader.upload(data, &response.detection_id);
        match tokio::time::timeout(self.timeouts.upload, upload).await {
            Ok(Ok(url)) => response.image_url = Some(url),
            Ok(Err(e)) => warn!("{} ({})", CompletionError::Upload(e), response.detection_id),
            Err(_) => warn!(
                "{} ({})",
                CompletionError::TimedOut(self.timeouts.upload.as_millis() as u64),
                response.detection_id
            ),
        }

        let save = self.storage.save_detection(&response);
        match tokio::time::timeout(self.timeouts.persist, save).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} ({})", CompletionError::Persist(e), response.detection_id),
            Err(_) => warn!(
                "{} ({})",
                CompletionError::TimedOut(self.timeouts.persist.as_millis() as u64),
                response.detection_id
            ),
        }

        response
    }

    fn background_task(&self, response: DetectionResponse, data: Bytes, user: &User) -> BackgroundTask {
        if user.is_guest {
            return BackgroundTask::Noop;
        }

        let store: Arc<dyn DetectionStore> = self.storage.clone();
        BackgroundTask::Complete(Box::new(CompletionJob::new(
            response,
            data,
            self.uploader.clone(),
            store,
            self.notifier.clone(),
            self.timeouts.background_task,
        )))
    }
}

/// Locate → crop → preprocess → classify → rank for one decoded image
pub fn run_inference(resources: &ModelResources, image: &RgbImage) -> Result<InferenceOutcome> {
    let boxes = resources.locator().locate(image)?;
    if boxes.is_empty() {
        return Ok(InferenceOutcome::NoFaces);
    }

    let crops = crop_faces(image, &boxes);
    let (processor, classifier) = resources.get_model_and_processor();
    let tensors: Vec<_> = crops.iter().map(|face| processor.preprocess(face)).collect();
    let batch = processor.batch(&tensors)?;

    let distributions = classifier.classify(&batch)?;
    if distributions.len() != boxes.len() {
        bail!(
            "classifier returned {} distributions for {} faces",
            distributions.len(),
            boxes.len()
        );
    }

    let fallback;
    let labels = match classifier.labels() {
        Some(labels) => labels,
        None => {
            fallback = LabelMap::fallback();
            &fallback
        }
    };

    let faces = boxes
        .into_iter()
        .zip(distributions)
        .map(|(face_box, probabilities)| FaceDetection {
            face_box,
            emotions: rank_emotions(&probabilities, labels),
        })
        .collect();

    Ok(InferenceOutcome::Faces(faces))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::*;

    struct Harness {
        locator: Arc<FakeLocator>,
        classifier: Arc<FakeClassifier>,
        store: Arc<RecordingStore>,
        uploader: Arc<RecordingUploader>,
        notifier: Arc<RecordingNotifier>,
        service: DetectionService<RecordingStore>,
    }

    fn harness_with(locator: FakeLocator, classifier: FakeClassifier, uploader: RecordingUploader, store: RecordingStore) -> Harness {
        let locator = Arc::new(locator);
        let classifier = Arc::new(classifier);
        let store = Arc::new(store);
        let uploader = Arc::new(uploader);
        let notifier = Arc::new(RecordingNotifier::default());
        let timeouts = PipelineTimeouts {
            inference: Duration::from_millis(200),
            upload: Duration::from_millis(200),
            persist: Duration::from_millis(200),
            background_task: Duration::from_secs(5),
        };
        let service = DetectionService::new(
            resources(locator.clone(), classifier.clone()),
            store.clone(),
            uploader.clone(),
            notifier.clone(),
            timeouts,
        );
        Harness { locator, classifier, store, uploader, notifier, service }
    }

    fn harness(locator: FakeLocator) -> Harness {
        harness_with(locator, FakeClassifier::happy(), RecordingUploader::default(), RecordingStore::default())
    }

    fn face_png() -> RawImage {
        RawImage::upload(Some("face.png".to_string()), Some("image/png".to_string()), png_bytes(32, 32))
    }

    fn registered() -> User {
        User::registered("user-42")
    }

    #[tokio::test]
    async fn test_single_face_ranked_scores() {
        let h = harness(FakeLocator::one_face());
        let outcome = h.service.detect(&face_png(), &User::anonymous(), DetectOptions::default()).await.unwrap();
        let result = outcome.response.detection_results;

        assert!(result.face_detected);
        assert_eq!(result.faces.len(), 1);
        let emotions = &result.faces[0].emotions;
        assert_eq!(emotions.len(), 7);
        assert_eq!(emotions[0].emotion, "happy");
        assert!(emotions[0].score >= 1.0 / 7.0);
        for pair in emotions.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for e in emotions {
            assert_eq!(e.percentage, e.score * 100.0);
        }
        assert!(result.processing_time >= 0.0);
        assert_eq!(h.service.metrics().accuracy(), 100.0);
        assert_eq!(h.classifier.calls(), 1);
    }

    #[tokio::test]
    async fn test_classifier_label_map_wins_over_fallback() {
        let classifier = FakeClassifier::new(vec![0.3, 0.7]).with_labels(LabelMap::from_labels(["calm", "excited"]));
        let h = harness_with(FakeLocator::one_face(), classifier, RecordingUploader::default(), RecordingStore::default());

        let outcome = h.service.detect(&face_png(), &User::anonymous(), DetectOptions::default()).await.unwrap();
        let emotions = &outcome.response.detection_results.faces[0].emotions;
        assert_eq!(emotions.len(), 2);
        assert_eq!(emotions[0].emotion, "excited");
    }

    #[tokio::test]
    async fn test_no_faces() {
        let h = harness(FakeLocator::no_faces());
        let outcome = h.service.detect(&face_png(), &User::anonymous(), DetectOptions::default()).await.unwrap();

        assert!(!outcome.response.detection_results.face_detected);
        assert!(outcome.response.detection_results.faces.is_empty());
        assert_eq!(h.service.metrics().accuracy(), 0.0);
        assert_eq!(h.classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_locator_error_degrades() {
        let h = harness(FakeLocator::new(LocatorBehavior::Fail));
        let outcome = h.service.detect(&face_png(), &User::anonymous(), DetectOptions::default()).await.unwrap();

        assert!(!outcome.response.detection_results.face_detected);
        assert_eq!(h.service.metrics().snapshot().degraded_inferences_total, 1);
    }

    #[tokio::test]
    async fn test_locator_panic_degrades() {
        let h = harness(FakeLocator::new(LocatorBehavior::Panic));
        let outcome = h.service.detect(&face_png(), &User::anonymous(), DetectOptions::default()).await.unwrap();
        assert!(outcome.response.detection_results.faces.is_empty());
        assert_eq!(h.service.metrics().snapshot().degraded_inferences_total, 1);
    }

    #[tokio::test]
    async fn test_inference_timeout_degrades() {
        let h = harness(FakeLocator::new(LocatorBehavior::Sleep(Duration::from_millis(600))));
        let outcome = h.service.detect(&face_png(), &User::anonymous(), DetectOptions::default()).await.unwrap();
        assert!(!outcome.response.detection_results.face_detected);
        assert_eq!(h.service.metrics().snapshot().degraded_inferences_total, 1);
    }

    #[tokio::test]
    async fn test_corrupt_image_surfaces_decode_error() {
        let h = harness(FakeLocator::one_face());
        let image = RawImage::upload(Some("broken.png".to_string()), Some("image/png".to_string()), corrupt_png());

        let err = h.service.detect(&image, &registered(), DetectOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "DECODE_FAILED");
        assert!(err.to_string().contains("broken.png"));
        assert_eq!(h.locator.calls(), 0);
        assert!(h.store.saved().is_empty());
    }

    #[tokio::test]
    async fn test_validation_error_surfaces() {
        let h = harness(FakeLocator::one_face());
        let image = RawImage::upload(Some("face.png".to_string()), Some("text/plain".to_string()), png_bytes(32, 32));

        let err = h.service.detect(&image, &registered(), DetectOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_CONTENT_TYPE");
        assert_eq!(h.locator.calls(), 0);
    }

    #[tokio::test]
    async fn test_guest_sync_skips_upload_and_persist() {
        let h = harness(FakeLocator::one_face());
        let outcome = h.service.detect(&face_png(), &User::anonymous(), DetectOptions::default()).await.unwrap();

        assert!(outcome.task.is_none());
        assert!(outcome.response.image_url.is_none());
        assert_eq!(h.uploader.calls(), 0);
        assert_eq!(h.store.attempts(), 0);
    }

    #[tokio::test]
    async fn test_registered_sync_uploads_then_persists() {
        let h = harness(FakeLocator::one_face());
        let outcome = h.service.detect(&face_png(), &registered(), DetectOptions::default()).await.unwrap();

        let url = format!("/data/uploads/{}.png", outcome.response.detection_id);
        assert_eq!(outcome.response.image_url.as_deref(), Some(url.as_str()));
        assert_eq!(outcome.response.user_id, "user-42");

        let saved = h.store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0], outcome.response);
    }

    #[tokio::test]
    async fn test_sync_upload_failure_is_swallowed() {
        let h = harness_with(FakeLocator::one_face(), FakeClassifier::happy(), RecordingUploader::failing(), RecordingStore::default());
        let outcome = h.service.detect(&face_png(), &registered(), DetectOptions::default()).await.unwrap();

        assert!(outcome.response.image_url.is_none());
        assert_eq!(h.store.saved().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_upload_timeout_is_swallowed() {
        let uploader = RecordingUploader::slow(Duration::from_secs(5));
        let h = harness_with(FakeLocator::one_face(), FakeClassifier::happy(), uploader, RecordingStore::default());
        let outcome = h.service.detect(&face_png(), &registered(), DetectOptions::default()).await.unwrap();

        assert!(outcome.response.image_url.is_none());
        assert_eq!(h.store.saved().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_persist_failure_is_swallowed() {
        let h = harness_with(FakeLocator::one_face(), FakeClassifier::happy(), RecordingUploader::default(), RecordingStore::failing());
        let outcome = h.service.detect(&face_png(), &registered(), DetectOptions::default()).await.unwrap();

        assert!(outcome.response.image_url.is_some());
        assert_eq!(h.store.attempts(), 1);
    }

    #[tokio::test]
    async fn test_sync_persist_timeout_returns_response() {
        let store = RecordingStore::hanging(Duration::from_secs(3600));
        let h = harness_with(FakeLocator::one_face(), FakeClassifier::happy(), RecordingUploader::default(), store);

        let png = face_png();
        let user = registered();
        let detect = h.service.detect(&png, &user, DetectOptions::default());
        let outcome = tokio::time::timeout(Duration::from_secs(3), detect)
            .await
            .expect("synchronous detection should not wait on a hung store")
            .unwrap();

        assert!(outcome.response.image_url.is_some());
        assert!(outcome.response.detection_results.face_detected);
        assert_eq!(h.store.attempts(), 1);
    }

    #[tokio::test]
    async fn test_classifier_error_degrades() {
        let h = harness_with(FakeLocator::one_face(), FakeClassifier::failing(), RecordingUploader::default(), RecordingStore::default());
        let outcome = h.service.detect(&face_png(), &User::anonymous(), DetectOptions::default()).await.unwrap();

        assert!(!outcome.response.detection_results.face_detected);
        assert!(outcome.response.detection_results.faces.is_empty());
        assert_eq!(h.classifier.calls(), 1);
        assert_eq!(h.service.metrics().snapshot().degraded_inferences_total, 1);
        assert_eq!(h.service.metrics().accuracy(), 0.0);
    }

    #[tokio::test]
    async fn test_multiple_faces_classified_in_one_batch() {
        let boxes = vec![
            FaceBox { x: 0, y: 0, width: 10, height: 10 },
            FaceBox { x: 16, y: 4, width: 12, height: 14 },
            FaceBox { x: 6, y: 18, width: 8, height: 8 },
        ];
        let locator = FakeLocator::new(LocatorBehavior::Boxes(boxes.clone()));
        let h = harness_with(locator, FakeClassifier::happy(), RecordingUploader::default(), RecordingStore::default());

        let outcome = h.service.detect(&face_png(), &User::anonymous(), DetectOptions::default()).await.unwrap();
        let faces = &outcome.response.detection_results.faces;

        assert_eq!(h.classifier.calls(), 1);
        assert_eq!(h.classifier.last_batch_size(), 3);
        assert_eq!(faces.len(), boxes.len());
        for (face, expected) in faces.iter().zip(&boxes) {
            assert_eq!(&face.face_box, expected);
            assert_eq!(face.emotions[0].emotion, "happy");
        }
    }

    #[tokio::test]
    async fn test_background_guest_gets_noop() {
        let h = harness(FakeLocator::one_face());
        let outcome = h.service.detect(&face_png(), &User::anonymous(), DetectOptions::background()).await.unwrap();

        let task = outcome.task.unwrap();
        assert!(task.is_noop());
        task.run().await;
        assert_eq!(h.uploader.calls(), 0);
        assert_eq!(h.store.attempts(), 0);
        assert!(h.notifier.done().is_empty());
    }

    #[tokio::test]
    async fn test_background_registered_defers_completion() {
        let h = harness(FakeLocator::one_face());
        let outcome = h.service.detect(&face_png(), &registered(), DetectOptions::background()).await.unwrap();

        assert!(outcome.response.image_url.is_none());
        assert_eq!(h.uploader.calls(), 0);
        assert_eq!(h.store.attempts(), 0);

        outcome.task.unwrap().run().await;

        let saved = h.store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].detection_id, outcome.response.detection_id);
        assert!(saved[0].image_url.is_some());
        assert_eq!(h.notifier.done(), vec![outcome.response.detection_id.clone()]);
        assert!(h.notifier.failed().is_empty());
    }

    #[test]
    fn test_run_inference_rejects_mismatched_distributions() {
        struct Empty;
        impl crate::engine::EmotionClassifier for Empty {
            fn labels(&self) -> Option<&LabelMap> {
                None
            }
            fn classify(&self, _batch: &ndarray::Array4<f32>) -> Result<Vec<Vec<f32>>> {
                Ok(Vec::new())
            }
        }

        let resources = ModelResources::new(
            Arc::new(FakeLocator::one_face()),
            Arc::new(Empty),
            crate::engine::FaceProcessor::new(8),
        );
        let image = RgbImage::new(32, 32);
        assert!(run_inference(&resources, &image).is_err());
    }
}
