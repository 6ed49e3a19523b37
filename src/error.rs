//! Error taxonomy for the detection pipeline
//!
//! Only validation, decode, batch-limit and internal failures ever reach the
//! caller. Inference faults degrade to an empty result and completion faults
//! are reported through notifications.

use thiserror::Error;

/// Upload rejected by the image validator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("File '{filename}' is not a supported image format (jpg, jpeg, png, gif).")]
    UnsupportedFormat { filename: String },

    #[error("File '{filename}' is not an image. Got content type: {content_type}")]
    InvalidContentType { filename: String, content_type: String },

    #[error("Image size ({size_kb:.1} KB) exceeds maximum allowed size ({limit_kb:.1} KB)")]
    FileTooLarge {
        size: usize,
        size_kb: f64,
        limit_kb: f64,
    },

    #[error("File '{filename}' is not a valid image format")]
    UnrecognizedImageData { filename: String },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::UnsupportedFormat { .. } => "UNSUPPORTED_FORMAT",
            ValidationError::InvalidContentType { .. } => "INVALID_CONTENT_TYPE",
            ValidationError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            ValidationError::UnrecognizedImageData { .. } => "UNRECOGNIZED_IMAGE",
        }
    }
}

/// Failure surfaced to the caller of the detection pipeline
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Cannot identify image format in file '{filename}': {message}")]
    Decode { filename: String, message: String },

    #[error("Batch size too large (max {limit} images per request). Please split your upload.")]
    BatchTooLarge { limit: usize, received: usize },

    #[error("{0}")]
    Internal(String),
}

impl DetectionError {
    /// Machine-readable error code used in API responses
    pub fn code(&self) -> &'static str {
        match self {
            DetectionError::Validation(e) => e.code(),
            DetectionError::Decode { .. } => "DECODE_FAILED",
            DetectionError::BatchTooLarge { .. } => "BATCH_TOO_LARGE",
            DetectionError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the failure was caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        !matches!(self, DetectionError::Internal(_))
    }
}

/// Failure inside a completion step (upload or persistence)
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("image upload failed: {0}")]
    Upload(anyhow::Error),

    #[error("failed to persist detection: {0}")]
    Persist(anyhow::Error),

    #[error("completion timed out after {0}ms")]
    TimedOut(u64),

    #[error("completion worker aborted: {0}")]
    Aborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_too_large_message_reports_kilobytes() {
        let err = ValidationError::FileTooLarge {
            size: 6 * 1024 * 1024,
            size_kb: 6144.0,
            limit_kb: 5120.0,
        };
        assert_eq!(
            err.to_string(),
            "Image size (6144.0 KB) exceeds maximum allowed size (5120.0 KB)"
        );
    }

    #[test]
    fn test_error_codes() {
        let err: DetectionError = ValidationError::UnrecognizedImageData {
            filename: "a.png".to_string(),
        }
        .into();
        assert_eq!(err.code(), "UNRECOGNIZED_IMAGE");
        assert!(err.is_client_error());

        let err = DetectionError::Internal("boom".to_string());
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_batch_too_large_names_limit() {
        let err = DetectionError::BatchTooLarge { limit: 30, received: 31 };
        assert!(err.to_string().contains("max 30 images"));
    }
}
