//! Fake collaborators shared by the service and API tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::Array4;
use parking_lot::Mutex;

use crate::engine::{EmotionClassifier, FaceLocator, FaceProcessor, LabelMap, ModelResources};
use crate::storage::{DetectionStore, ImageUploader};
use crate::utils::image::encode_png;

use super::notification::Notifier;
use super::types::{DetectionResponse, DetectionResult, FaceBox};

/// Small gradient PNG
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| Rgb([(x * 7) as u8, (y * 5) as u8, 128]));
    encode_png(&DynamicImage::ImageRgb8(image)).unwrap()
}

/// Passes magic-byte sniffing as a PNG but cannot be decoded
pub fn corrupt_png() -> Vec<u8> {
    let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    data.extend_from_slice(b"this is not really a png body");
    data
}

pub fn sample_response(detection_id: &str, user_id: &str) -> DetectionResponse {
    DetectionResponse {
        detection_id: detection_id.to_string(),
        user_id: user_id.to_string(),
        timestamp: Utc::now(),
        image_url: None,
        detection_results: DetectionResult::new(Vec::new(), 0.01),
    }
}

/// How a fake locator behaves
#[derive(Clone)]
pub enum LocatorBehavior {
    Boxes(Vec<FaceBox>),
    Fail,
    Panic,
    Sleep(Duration),
}

pub struct FakeLocator {
    behavior: LocatorBehavior,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
    width_delays: Vec<(u32, Duration)>,
}

impl FakeLocator {
    pub fn new(behavior: LocatorBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::ZERO,
            width_delays: Vec::new(),
        }
    }

    /// One face covering the centre of the image
    pub fn one_face() -> Self {
        Self::new(LocatorBehavior::Boxes(vec![FaceBox { x: 2, y: 2, width: 12, height: 12 }]))
    }

    pub fn no_faces() -> Self {
        Self::new(LocatorBehavior::Boxes(Vec::new()))
    }

    /// Hold every call for `delay` so overlapping calls can be observed
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Hold only calls whose image is `width` pixels wide
    pub fn with_delay_for_width(mut self, width: u32, delay: Duration) -> Self {
        self.width_delays.push((width, delay));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Largest number of calls that were in flight at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl FaceLocator for FakeLocator {
    fn locate(&self, image: &RgbImage) -> Result<Vec<FaceBox>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = self
            .width_delays
            .iter()
            .find(|(width, _)| *width == image.width())
            .map_or(self.delay, |(_, delay)| *delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        match &self.behavior {
            LocatorBehavior::Boxes(boxes) => Ok(boxes.clone()),
            LocatorBehavior::Fail => bail!("locator backend unavailable"),
            LocatorBehavior::Panic => panic!("locator crashed"),
            LocatorBehavior::Sleep(duration) => {
                std::thread::sleep(*duration);
                Ok(Vec::new())
            }
        }
    }
}

/// Returns the same distribution for every face
pub struct FakeClassifier {
    probabilities: Vec<f32>,
    labels: Option<LabelMap>,
    calls: AtomicUsize,
    last_batch: AtomicUsize,
    fail: bool,
}

impl FakeClassifier {
    pub fn new(probabilities: Vec<f32>) -> Self {
        Self {
            probabilities,
            labels: None,
            calls: AtomicUsize::new(0),
            last_batch: AtomicUsize::new(0),
            fail: false,
        }
    }

    /// Seven-class distribution with `happy` on top
    pub fn happy() -> Self {
        Self::new(vec![0.05, 0.02, 0.03, 0.6, 0.1, 0.08, 0.12])
    }

    /// Errors on every call
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::happy()
        }
    }

    pub fn with_labels(mut self, labels: LabelMap) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of faces in the most recent batch
    pub fn last_batch_size(&self) -> usize {
        self.last_batch.load(Ordering::SeqCst)
    }
}

impl EmotionClassifier for FakeClassifier {
    fn labels(&self) -> Option<&LabelMap> {
        self.labels.as_ref()
    }

    fn classify(&self, batch: &Array4<f32>) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_batch.store(batch.shape()[0], Ordering::SeqCst);
        if self.fail {
            bail!("emotion model returned no output");
        }
        Ok(vec![self.probabilities.clone(); batch.shape()[0]])
    }
}

pub fn resources(locator: Arc<FakeLocator>, classifier: Arc<FakeClassifier>) -> Arc<ModelResources> {
    Arc::new(ModelResources::new(locator, classifier, FaceProcessor::new(8)))
}

#[derive(Default)]
pub struct RecordingStore {
    saved: Mutex<Vec<DetectionResponse>>,
    attempts: AtomicUsize,
    fail: bool,
    hang: Option<Duration>,
}

impl RecordingStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Records the save, then holds the call open for `delay`
    pub fn hanging(delay: Duration) -> Self {
        Self {
            hang: Some(delay),
            ..Self::default()
        }
    }

    pub fn saved(&self) -> Vec<DetectionResponse> {
        self.saved.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DetectionStore for RecordingStore {
    async fn save_detection(&self, detection: &DetectionResponse) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("database is locked");
        }
        self.saved.lock().push(detection.clone());
        if let Some(delay) = self.hang {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn get_detection(&self, detection_id: &str) -> Result<Option<DetectionResponse>> {
        Ok(self
            .saved
            .lock()
            .iter()
            .find(|d| d.detection_id == detection_id)
            .cloned())
    }

    async fn list_detections(&self, user_id: &str, offset: i64, limit: i64) -> Result<Vec<DetectionResponse>> {
        Ok(self
            .saved
            .lock()
            .iter()
            .rev()
            .filter(|d| d.user_id == user_id)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn delete_detection(&self, detection_id: &str, user_id: &str) -> Result<bool> {
        let mut saved = self.saved.lock();
        let before = saved.len();
        saved.retain(|d| !(d.detection_id == detection_id && d.user_id == user_id));
        Ok(saved.len() != before)
    }

    async fn count_detections(&self) -> Result<i64> {
        Ok(self.saved.lock().len() as i64)
    }
}

#[derive(Default)]
pub struct RecordingUploader {
    calls: AtomicUsize,
    fail: bool,
    delay: Option<Duration>,
}

impl RecordingUploader {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageUploader for RecordingUploader {
    async fn upload(&self, _data: &[u8], detection_id: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(anyhow!("bucket unreachable"));
        }
        Ok(format!("/data/uploads/{}.png", detection_id))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    done: Mutex<Vec<String>>,
    failed: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn done(&self) -> Vec<String> {
        self.done.lock().clone()
    }

    pub fn failed(&self) -> Vec<String> {
        self.failed.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify_done(&self, detection_id: &str) {
        self.done.lock().push(detection_id.to_string());
    }

    fn notify_failed(&self, detection_id: &str) {
        self.failed.lock().push(detection_id.to_string());
    }
}
