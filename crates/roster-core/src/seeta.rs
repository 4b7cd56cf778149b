//! SeetaFace funnel-structured cascade detector via `rustface`.
//!
//! Pure Rust, no ONNX runtime; needs only the `seeta_fd_frontal_v1.0.bin`
//! model file. Boxes carry no landmarks.

use crate::detector::{ensure_not_empty, DetectorError, FaceDetector};
use crate::types::BoundingBox;
use image::GrayImage;
use rustface::{Detector, ImageData};
use std::path::Path;

/// The cascade's sliding window; smaller images cannot contain a detection.
const SEETA_WINDOW_SIZE: u32 = 20;
const SEETA_SCORE_THRESHOLD: f64 = 2.0;
const SEETA_PYRAMID_SCALE: f32 = 0.8;
const SEETA_WINDOW_STEP: u32 = 4;

pub struct SeetaDetector {
    inner: Box<dyn Detector>,
}

impl SeetaDetector {
    /// Load the SeetaFace detection model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        let path = model_path
            .to_str()
            .ok_or_else(|| DetectorError::ModelLoad(format!("non UTF-8 path: {}", model_path.display())))?;

        let mut inner =
            rustface::create_detector(path).map_err(|e| DetectorError::ModelLoad(e.to_string()))?;
        inner.set_min_face_size(SEETA_WINDOW_SIZE);
        inner.set_score_thresh(SEETA_SCORE_THRESHOLD);
        inner.set_pyramid_scale_factor(SEETA_PYRAMID_SCALE);
        inner.set_slide_window_step(SEETA_WINDOW_STEP, SEETA_WINDOW_STEP);

        tracing::info!(path = %model_path.display(), "loaded SeetaFace model");

        Ok(Self { inner })
    }
}

impl FaceDetector for SeetaDetector {
    /// Detect faces, sorted by descending cascade score.
    ///
    /// `confidence` carries the raw cascade score, which is not a probability.
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        ensure_not_empty(image)?;
        if image.width() < SEETA_WINDOW_SIZE || image.height() < SEETA_WINDOW_SIZE {
            return Ok(Vec::new());
        }

        let mut data = ImageData::new(image.as_raw(), image.width(), image.height());
        let mut faces: Vec<BoundingBox> = self
            .inner
            .detect(&mut data)
            .into_iter()
            .map(|face| {
                let bbox = face.bbox();
                BoundingBox {
                    x: bbox.x() as f32,
                    y: bbox.y() as f32,
                    width: bbox.width() as f32,
                    height: bbox.height() as f32,
                    confidence: face.score() as f32,
                    landmarks: None,
                }
            })
            .collect();

        faces.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(faces)
    }

    fn name(&self) -> &'static str {
        "seetaface"
    }
}
