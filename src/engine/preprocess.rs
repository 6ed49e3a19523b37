//! Image preprocessing for emotion classification

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::{Array3, Array4, ArrayView3, Axis};

use crate::service::types::FaceBox;

/// Default classifier input size (ViT-style emotion models)
pub const DEFAULT_FACE_INPUT_SIZE: u32 = 224;

/// Pixel layout expected by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Rgb,
    Grayscale,
}

/// Converts cropped faces into model-ready tensors
#[derive(Debug, Clone)]
pub struct FaceProcessor {
    input_size: (u32, u32),
    color: ColorMode,
    /// Multiplier applied to raw 0..=255 values
    scale: f32,
}

impl FaceProcessor {
    /// RGB input resized to `size` x `size`, scaled to [0, 1]
    pub fn new(size: u32) -> Self {
        Self {
            input_size: (size, size),
            color: ColorMode::Rgb,
            scale: 1.0 / 255.0,
        }
    }

    /// FER+ expects 64x64 grayscale with raw pixel values, no normalization
    pub fn ferplus() -> Self {
        Self {
            input_size: (64, 64),
            color: ColorMode::Grayscale,
            scale: 1.0,
        }
    }

    pub fn channels(&self) -> usize {
        match self.color {
            ColorMode::Rgb => 3,
            ColorMode::Grayscale => 1,
        }
    }

    /// Resize one face and lay it out as CHW
    pub fn preprocess(&self, face: &RgbImage) -> Array3<f32> {
        let (w, h) = self.input_size;
        let resized = image::imageops::resize(face, w, h, FilterType::Triangle);
        let mut tensor = Array3::<f32>::zeros((self.channels(), h as usize, w as usize));

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            match self.color {
                ColorMode::Rgb => {
                    for c in 0..3 {
                        tensor[[c, y, x]] = pixel[c] as f32 * self.scale;
                    }
                }
                ColorMode::Grayscale => {
                    // ITU-R 601 luma, same weights as image::imageops::grayscale
                    let luma = 0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32;
                    tensor[[0, y, x]] = luma * self.scale;
                }
            }
        }

        tensor
    }

    /// Stack per-face tensors into a single NCHW batch
    pub fn batch(&self, faces: &[Array3<f32>]) -> Result<Array4<f32>> {
        let views: Vec<ArrayView3<f32>> = faces.iter().map(|f| f.view()).collect();
        ndarray::stack(Axis(0), &views).context("Failed to stack face tensors")
    }
}

impl Default for FaceProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_FACE_INPUT_SIZE)
    }
}

/// Crop every box out of the image
///
/// Boxes are clamped to the image bounds and never collapse below 1x1,
/// so the output stays index-aligned with `boxes`.
pub fn crop_faces(image: &RgbImage, boxes: &[FaceBox]) -> Vec<RgbImage> {
    let (img_w, img_h) = image.dimensions();

    boxes
        .iter()
        .map(|b| {
            let x = b.x.min(img_w.saturating_sub(1));
            let y = b.y.min(img_h.saturating_sub(1));
            let w = b.width.clamp(1, img_w - x);
            let h = b.height.clamp(1, img_h - y);
            image::imageops::crop_imm(image, x, y, w, h).to_image()
        })
        .collect()
}

/// Decode image bytes into RGB, honoring the EXIF orientation tag
pub fn decode_image(data: &[u8]) -> Result<RgbImage, image::ImageError> {
    let image = image::load_from_memory(data)?;
    Ok(apply_exif_orientation(data, image).to_rgb8())
}

/// Phones often store rotation as an EXIF tag instead of rotating the pixels
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    use std::io::Cursor;

    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    };

    // https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}
