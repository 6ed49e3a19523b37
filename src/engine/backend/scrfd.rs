//! SCRFD Face Locator
//!
//! Face localization with the InsightFace SCRFD model. Only boxes are used;
//! keypoint outputs are ignored.

use std::sync::Arc;

use anyhow::{Context, Result};
use image::{imageops::FilterType, Rgb, RgbImage};
use openvino::InferRequest;
use tracing::{debug, warn};

use crate::engine::FaceLocator;
use crate::service::types::FaceBox;

use super::pool::{ModelPool, ModelType};
use super::{input_tensor, read_tensor_f32};

/// SCRFD network input (width, height)
pub const DETECTOR_INPUT_SIZE: (u32, u32) = (640, 640);

/// Raw detection in original-image coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    fn to_face_box(self) -> FaceBox {
        FaceBox {
            x: self.x1.round() as u32,
            y: self.y1.round() as u32,
            width: (self.x2 - self.x1).round().max(1.0) as u32,
            height: (self.y2 - self.y1).round().max(1.0) as u32,
        }
    }
}

/// Letterbox geometry, used to map detections back to the original image
#[derive(Debug, Clone, Copy)]
struct ResizeInfo {
    scale: f32,
    offset_x: u32,
    offset_y: u32,
    original_width: u32,
    original_height: u32,
}

impl ResizeInfo {
    fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        let (orig_w, orig_h) = original;
        let (target_w, target_h) = target;
        let scale = f32::min(target_w as f32 / orig_w as f32, target_h as f32 / orig_h as f32);

        let new_w = ((orig_w as f32 * scale) as u32).clamp(1, target_w);
        let new_h = ((orig_h as f32 * scale) as u32).clamp(1, target_h);

        Self {
            scale,
            offset_x: (target_w - new_w) / 2,
            offset_y: (target_h - new_h) / 2,
            original_width: orig_w,
            original_height: orig_h,
        }
    }

    fn resized(&self) -> (u32, u32) {
        (
            ((self.original_width as f32 * self.scale) as u32).max(1),
            ((self.original_height as f32 * self.scale) as u32).max(1),
        )
    }

    /// Network coordinates back to original image space, clamped to its bounds
    fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        let x = (x - self.offset_x as f32) / self.scale;
        let y = (y - self.offset_y as f32) / self.scale;
        (
            x.clamp(0.0, self.original_width as f32),
            y.clamp(0.0, self.original_height as f32),
        )
    }
}

/// SCRFD face locator backed by the model pool
pub struct ScrfdLocator {
    pool: Arc<ModelPool>,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdLocator {
    pub fn new(pool: Arc<ModelPool>, confidence_threshold: f32) -> Self {
        Self {
            pool,
            confidence_threshold,
            nms_threshold: 0.4,
        }
    }

    /// Letterbox into the network input and lay out as NCHW, normalized to [-1, 1]
    fn preprocess(image: &RgbImage, info: &ResizeInfo) -> Vec<f32> {
        let (target_w, target_h) = DETECTOR_INPUT_SIZE;
        let (new_w, new_h) = info.resized();
        let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let mut canvas = RgbImage::from_pixel(target_w, target_h, Rgb([0, 0, 0]));
        image::imageops::replace(&mut canvas, &resized, info.offset_x as i64, info.offset_y as i64);

        let plane = (target_w * target_h) as usize;
        let mut data = vec![0f32; plane * 3];
        for (x, y, pixel) in canvas.enumerate_pixels() {
            let idx = (y * target_w + x) as usize;
            for c in 0..3 {
                data[c * plane + idx] = (pixel[c] as f32 - 127.5) / 128.0;
            }
        }
        data
    }

    /// Decode per-stride score/bbox outputs into candidates
    ///
    /// Output layouts by count: 6/9 are three strides with two anchors, 10/15
    /// are five strides with one anchor. Scores come first, then boxes.
    fn parse_outputs(&self, request: &InferRequest, info: &ResizeInfo) -> Result<Vec<Candidate>> {
        let output_count = (0..20)
            .take_while(|&i| request.get_output_tensor_by_index(i).is_ok())
            .count();

        let (fmc, num_anchors) = match output_count {
            6 | 9 => (3, 2),
            10 | 15 => (5, 1),
            _ => {
                warn!("Unknown SCRFD output count: {}, assuming 3 strides", output_count);
                (3, 2)
            }
        };
        let strides: &[u32] = if fmc == 3 { &[8, 16, 32] } else { &[8, 16, 32, 64, 128] };
        let (input_w, input_h) = DETECTOR_INPUT_SIZE;

        let mut candidates = Vec::new();
        for (idx, &stride) in strides.iter().enumerate() {
            let scores = read_tensor_f32(&request.get_output_tensor_by_index(idx)?)?;
            let bboxes = read_tensor_f32(&request.get_output_tensor_by_index(idx + fmc)?)?;

            let (feat_w, feat_h) = (input_w / stride, input_h / stride);
            let s = stride as f32;
            // Row-major anchor centers, each repeated once per anchor
            let anchors = (0..feat_h)
                .flat_map(|y| (0..feat_w).map(move |x| (x as f32 * s, y as f32 * s)))
                .flat_map(|center| std::iter::repeat(center).take(num_anchors));

            for (i, (cx, cy)) in anchors.enumerate() {
                let Some(&score) = scores.get(i) else { break };
                if score < self.confidence_threshold {
                    continue;
                }
                let Some(d) = bboxes.get(i * 4..i * 4 + 4) else { break };

                let (x1, y1) = info.to_original(cx - d[0] * s, cy - d[1] * s);
                let (x2, y2) = info.to_original(cx + d[2] * s, cy + d[3] * s);
                candidates.push(Candidate { x1, y1, x2, y2, score });
            }
        }

        debug!("SCRFD produced {} candidates before NMS", candidates.len());
        Ok(candidates)
    }
}

impl FaceLocator for ScrfdLocator {
    fn locate(&self, image: &RgbImage) -> Result<Vec<FaceBox>> {
        let info = ResizeInfo::new(image.dimensions(), DETECTOR_INPUT_SIZE);
        let data = Self::preprocess(image, &info);

        let model = self.pool.get_model(ModelType::Detector)?;
        let mut request = model.create_infer_request()?;

        let (w, h) = DETECTOR_INPUT_SIZE;
        let input = input_tensor(&data, &[1, 3, h as i64, w as i64])?;
        request.set_input_tensor(&input)?;
        request.infer().context("SCRFD inference failed")?;

        let candidates = self.parse_outputs(&request, &info)?;
        let kept = nms(candidates, self.nms_threshold);
        debug!("Located {} face(s)", kept.len());

        Ok(kept
            .into_iter()
            .filter(|c| c.area() > 0.0)
            .map(Candidate::to_face_box)
            .collect())
    }
}

/// Non-maximum suppression, highest score first
fn nms(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if keep.iter().all(|k| k.iou(&candidate) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}
