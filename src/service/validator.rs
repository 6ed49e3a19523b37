//! Upload validation
//!
//! Checks run in a fixed order: extension, content type, size, magic bytes.
//! The first failing check wins.

use bytes::Bytes;

use crate::error::ValidationError;

use super::types::{ImageOrigin, RawImage};

/// Largest accepted image, in bytes (5 MiB)
pub const MAX_FILE_SIZE: usize = 5 * 1024 * 1024;

const ALLOWED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];

/// Validate an upload and return its bytes
///
/// `permissive` skips the content-type check, but only for in-memory buffers.
/// The image is not consumed, so validating twice gives the same answer.
pub fn validate_image(image: &RawImage, permissive: bool) -> Result<Bytes, ValidationError> {
    let filename = image.display_name();

    if !has_allowed_extension(image.filename.as_deref()) {
        return Err(ValidationError::UnsupportedFormat {
            filename: filename.to_string(),
        });
    }

    let skip_content_type = permissive && image.origin == ImageOrigin::InMemory;
    if !skip_content_type {
        let content_type = image.content_type.as_deref().unwrap_or_default();
        if !content_type.starts_with("image/") {
            return Err(ValidationError::InvalidContentType {
                filename: filename.to_string(),
                content_type: image.content_type.clone().unwrap_or_else(|| "None".to_string()),
            });
        }
    }

    let size = image.data.len();
    if size > MAX_FILE_SIZE {
        return Err(ValidationError::FileTooLarge {
            size,
            size_kb: size as f64 / 1024.0,
            limit_kb: MAX_FILE_SIZE as f64 / 1024.0,
        });
    }

    if image::guess_format(&image.data).is_err() {
        return Err(ValidationError::UnrecognizedImageData {
            filename: filename.to_string(),
        });
    }

    Ok(image.data.clone())
}

/// Non-empty stem followed by one of the allowed extensions, case-insensitive
fn has_allowed_extension(filename: Option<&str>) -> bool {
    let Some(name) = filename else {
        return false;
    };

    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            ALLOWED_EXTENSIONS.iter().any(|allowed| ext.eq_ignore_ascii_case(allowed))
        }
        _ => false,
    }
}
