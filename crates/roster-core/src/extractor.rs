//! The feature-extraction seam shared by the embedding and pixel strategies.

use crate::types::{BoundingBox, ExtractorKind, FeatureVector};
use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("encoding failed: {0}")]
    EncodingFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a face region of a grayscale image into a fixed-length feature vector.
///
/// Extraction is a pure function of image and region: implementations may
/// hold inference sessions (hence `&mut self`) but keep no per-call state.
pub trait FeatureExtractor {
    fn kind(&self) -> ExtractorKind;

    /// Identifies the exact feature space (model version, crop size).
    /// Cached vectors recorded under a different signature are discarded.
    fn signature(&self) -> String;

    fn extract(&mut self, image: &GrayImage, region: &BoundingBox) -> Result<FeatureVector, ExtractError>;
}
