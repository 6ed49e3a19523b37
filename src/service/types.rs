//! Service layer types

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::service::background::BackgroundTask;

/// Where an image's bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOrigin {
    /// Received from a client upload
    Upload,
    /// Pre-validated buffer built by internal callers
    InMemory,
}

/// An uploaded image, not yet validated
#[derive(Debug, Clone)]
pub struct RawImage {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
    pub origin: ImageOrigin,
}

impl RawImage {
    pub fn upload(filename: Option<String>, content_type: Option<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename,
            content_type,
            data: data.into(),
            origin: ImageOrigin::Upload,
        }
    }

    pub fn in_memory(filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: Some(filename.into()),
            content_type: None,
            data: data.into(),
            origin: ImageOrigin::InMemory,
        }
    }

    /// Filename for messages, `None` when absent
    pub fn display_name(&self) -> &str {
        self.filename.as_deref().unwrap_or("None")
    }
}

/// Face bounding box in decoded-image pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionScore {
    pub emotion: String,
    pub score: f32,
    pub percentage: f32,
}

impl EmotionScore {
    pub fn new(emotion: impl Into<String>, score: f32) -> Self {
        Self {
            emotion: emotion.into(),
            score,
            percentage: score * 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    #[serde(rename = "box")]
    pub face_box: FaceBox,
    pub emotions: Vec<EmotionScore>,
}

/// Detection result for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub faces: Vec<FaceDetection>,
    pub face_detected: bool,
    /// Wall-clock seconds from request start to assembly
    pub processing_time: f64,
}

impl DetectionResult {
    pub fn new(faces: Vec<FaceDetection>, processing_time: f64) -> Self {
        Self {
            face_detected: !faces.is_empty(),
            faces,
            processing_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub detection_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub image_url: Option<String>,
    pub detection_results: DetectionResult,
}

/// Caller identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    pub is_guest: bool,
}

impl User {
    pub const GUEST_PREFIX: &'static str = "guest_";

    pub fn registered(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_guest: false,
        }
    }

    pub fn guest(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_guest: true,
        }
    }

    /// Guest with a freshly generated `guest_<uuid>` id
    pub fn anonymous() -> Self {
        Self::guest(format!("{}{}", Self::GUEST_PREFIX, uuid::Uuid::new_v4()))
    }
}

/// Result of the locate → classify stage
///
/// `Degraded` is the fault-containment path: the caller still gets a
/// (face-less) result.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutcome {
    Faces(Vec<FaceDetection>),
    NoFaces,
    Degraded { reason: String },
}

impl InferenceOutcome {
    pub fn into_faces(self) -> Vec<FaceDetection> {
        match self {
            InferenceOutcome::Faces(faces) => faces,
            InferenceOutcome::NoFaces | InferenceOutcome::Degraded { .. } => Vec::new(),
        }
    }
}

/// How the post-detection upload/persist step runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Upload and persist before returning
    #[default]
    Synchronous,
    /// Return a task for the caller's executor
    Background,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetectOptions {
    pub completion: CompletionMode,
    /// Skip the content-type check for in-memory buffers
    pub permissive_content_type: bool,
}

impl DetectOptions {
    pub fn background() -> Self {
        Self {
            completion: CompletionMode::Background,
            ..Self::default()
        }
    }
}

/// Response plus the deferred completion work, if any
#[derive(Debug)]
pub struct DetectionOutcome {
    pub response: DetectionResponse,
    /// `Some` exactly when background completion was requested
    pub task: Option<BackgroundTask>,
}

/// One entry in a batch result, keyed by input position
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BatchEntry {
    Success {
        index: usize,
        filename: Option<String>,
        #[serde(flatten)]
        response: DetectionResponse,
    },
    Failure(BatchFailure),
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub filename: Option<String>,
    pub error: String,
    pub code: String,
}

impl BatchEntry {
    pub fn index(&self) -> usize {
        match self {
            BatchEntry::Success { index, .. } => *index,
            BatchEntry::Failure(failure) => failure.index,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, BatchEntry::Failure(_))
    }
}

/// Batch results in completion order plus the background work they produced
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<BatchEntry>,
    pub background_tasks: Vec<BackgroundTask>,
}
