//! Detector + extractor pairing, and the strategy fallback order.
//!
//! `Auto` prefers SCRFD + ArcFace embeddings. Without both models it falls back
//! to pixel features over the best detector that loads: SCRFD, then the
//! SeetaFace cascade, then the whole frame as a single face.

use crate::detector::{DetectorError, Detections, FaceDetector, FullFrameDetector, ScrfdDetector};
use crate::embedding::ArcFaceExtractor;
use crate::extractor::{ExtractError, FeatureExtractor};
use crate::pixel::{PixelConfig, PixelExtractor};
use crate::seeta::SeetaDetector;
use crate::types::{BoundingBox, ExtractorKind, FeatureVector};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";
pub const SEETA_MODEL_FILE: &str = "seeta_fd_frontal_v1.0.bin";

#[derive(Error, Debug)]
pub enum FaceError {
    #[error("no face found")]
    NoFaceFound,
    #[error("multiple faces found ({0}); exactly one is required")]
    MultipleFaces(usize),
    #[error("face too small (minimum {min_face_size}px)")]
    FaceTooSmall { min_face_size: u32 },
    #[error("encoding failed: {0}")]
    EncodingFailed(#[from] ExtractError),
    #[error("detection failed: {0}")]
    Detector(#[from] DetectorError),
}

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("embedding strategy unavailable: {0}")]
    EmbeddingUnavailable(String),
}

/// Which extraction strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyPreference {
    /// Embedding if its models load, else pixel features.
    #[default]
    Auto,
    Embedding,
    Pixel,
}

impl FromStr for StrategyPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "embedding" => Ok(Self::Embedding),
            "pixel" => Ok(Self::Pixel),
            other => Err(format!("unknown strategy '{other}' (expected auto, embedding or pixel)")),
        }
    }
}

impl fmt::Display for StrategyPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Embedding => "embedding",
            Self::Pixel => "pixel",
        })
    }
}

/// Locations of the optional model files.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPaths {
    pub scrfd: PathBuf,
    pub arcface: PathBuf,
    pub seeta: PathBuf,
}

impl ModelPaths {
    /// Standard file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            scrfd: dir.join(SCRFD_MODEL_FILE),
            arcface: dir.join(ARCFACE_MODEL_FILE),
            seeta: dir.join(SEETA_MODEL_FILE),
        }
    }
}

/// A detector and an extractor run together: image in, face vectors out.
pub struct FacePipeline {
    detector: Box<dyn FaceDetector>,
    extractor: Box<dyn FeatureExtractor>,
    min_face_size: u32,
}

impl FacePipeline {
    pub fn new(detector: Box<dyn FaceDetector>, extractor: Box<dyn FeatureExtractor>, min_face_size: u32) -> Self {
        Self {
            detector,
            extractor,
            min_face_size,
        }
    }

    /// Build the pipeline for `preference`, falling back as described in the
    /// module docs. Only a forced `Embedding` preference can fail.
    pub fn select(
        preference: StrategyPreference,
        models: &ModelPaths,
        pixel: &PixelConfig,
        min_face_size: u32,
    ) -> Result<Self, StrategyError> {
        let mut scrfd_failure = None;
        let mut scrfd = match ScrfdDetector::load(&models.scrfd) {
            Ok(detector) => Some(detector),
            Err(e) => {
                scrfd_failure = Some(format!("SCRFD detector: {e}"));
                None
            }
        };

        if preference != StrategyPreference::Pixel {
            let reason = match scrfd.take() {
                None => scrfd_failure.clone().unwrap_or_default(),
                Some(detector) => match ArcFaceExtractor::load(&models.arcface) {
                    Ok(extractor) => {
                        tracing::info!(strategy = "embedding", detector = "scrfd", "face pipeline ready");
                        return Ok(Self::new(Box::new(detector), Box::new(extractor), min_face_size));
                    }
                    Err(e) => {
                        scrfd = Some(detector);
                        format!("ArcFace extractor: {e}")
                    }
                },
            };

            if preference == StrategyPreference::Embedding {
                return Err(StrategyError::EmbeddingUnavailable(reason));
            }
            tracing::warn!(%reason, "embedding strategy unavailable, falling back to pixel features");
        }

        let detector: Box<dyn FaceDetector> = match scrfd {
            Some(detector) => Box::new(detector),
            None => match SeetaDetector::load(&models.seeta) {
                Ok(detector) => Box::new(detector),
                Err(e) => {
                    tracing::warn!(error = %e, "no face detector model available, treating whole images as faces");
                    Box::new(FullFrameDetector)
                }
            },
        };

        tracing::info!(strategy = "pixel", detector = detector.name(), size = pixel.size, "face pipeline ready");
        Ok(Self::new(detector, Box::new(PixelExtractor::new(pixel.size)), min_face_size))
    }

    pub fn kind(&self) -> ExtractorKind {
        self.extractor.kind()
    }

    pub fn signature(&self) -> String {
        self.extractor.signature()
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn min_face_size(&self) -> u32 {
        self.min_face_size
    }

    pub fn detect(&mut self, gray: &GrayImage) -> Result<Detections, FaceError> {
        Ok(self.detector.locate(gray, self.min_face_size)?)
    }

    /// Registration path: exactly one face of acceptable size, or a typed failure.
    pub fn extract_single(&mut self, gray: &GrayImage) -> Result<(BoundingBox, FeatureVector), FaceError> {
        let detections = self.detect(gray)?;

        match detections.faces.len() {
            0 if detections.undersized > 0 => Err(FaceError::FaceTooSmall {
                min_face_size: self.min_face_size,
            }),
            0 => Err(FaceError::NoFaceFound),
            1 => {
                let region = detections.faces.into_iter().next().ok_or(FaceError::NoFaceFound)?;
                let vector = self.extractor.extract(gray, &region)?;
                Ok((region, vector))
            }
            n => Err(FaceError::MultipleFaces(n)),
        }
    }

    /// Gallery rebuild path: the primary face only, extra faces ignored.
    pub fn extract_primary(&mut self, gray: &GrayImage) -> Result<(BoundingBox, FeatureVector), FaceError> {
        let detections = self.detect(gray)?;
        let Some(region) = detections.faces.into_iter().next() else {
            return Err(if detections.undersized > 0 {
                FaceError::FaceTooSmall {
                    min_face_size: self.min_face_size,
                }
            } else {
                FaceError::NoFaceFound
            });
        };
        let vector = self.extractor.extract(gray, &region)?;
        Ok((region, vector))
    }

    /// Recognition path: every acceptable face, in detector order. No face is
    /// an empty list, not an error.
    pub fn extract_all(&mut self, gray: &GrayImage) -> Result<Vec<(BoundingBox, FeatureVector)>, FaceError> {
        let detections = self.detect(gray)?;

        let mut probes = Vec::with_capacity(detections.faces.len());
        for region in detections.faces {
            let vector = self.extractor.extract(gray, &region)?;
            probes.push((region, vector));
        }

        tracing::debug!(faces = probes.len(), "extracted probe vectors");
        Ok(probes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{textured_image, FixedDetector};

    fn pipeline_with(boxes: Vec<BoundingBox>) -> FacePipeline {
        FacePipeline::new(
            Box::new(FixedDetector::new(boxes)),
            Box::new(PixelExtractor::new(32)),
            50,
        )
    }

    #[test]
    fn test_single_face_extracted() {
        let mut pipeline = pipeline_with(vec![BoundingBox::new(10.0, 10.0, 80.0, 80.0)]);
        let (region, vector) = pipeline.extract_single(&textured_image(100, 100, 1)).unwrap();
        assert_eq!(region.width, 80.0);
        assert_eq!(vector.len(), 32 * 32);
    }

    #[test]
    fn test_no_face() {
        let mut pipeline = pipeline_with(Vec::new());
        let err = pipeline.extract_single(&textured_image(100, 100, 1)).unwrap_err();
        assert!(matches!(err, FaceError::NoFaceFound));
    }

    #[test]
    fn test_multiple_faces() {
        let mut pipeline = pipeline_with(vec![
            BoundingBox::new(0.0, 0.0, 60.0, 60.0),
            BoundingBox::new(60.0, 60.0, 60.0, 60.0),
        ]);
        let err = pipeline.extract_single(&textured_image(120, 120, 1)).unwrap_err();
        assert!(matches!(err, FaceError::MultipleFaces(2)));
    }

    #[test]
    fn test_only_undersized_face() {
        let mut pipeline = pipeline_with(vec![BoundingBox::new(0.0, 0.0, 30.0, 30.0)]);
        let err = pipeline.extract_single(&textured_image(100, 100, 1)).unwrap_err();
        assert!(matches!(err, FaceError::FaceTooSmall { min_face_size: 50 }));
    }

    #[test]
    fn test_undersized_extra_face_ignored() {
        let mut pipeline = pipeline_with(vec![
            BoundingBox::new(0.0, 0.0, 80.0, 80.0),
            BoundingBox::new(85.0, 85.0, 10.0, 10.0),
        ]);
        assert!(pipeline.extract_single(&textured_image(100, 100, 1)).is_ok());
    }

    #[test]
    fn test_primary_takes_first_face() {
        let mut pipeline = pipeline_with(vec![
            BoundingBox::new(40.0, 40.0, 60.0, 60.0),
            BoundingBox::new(0.0, 0.0, 60.0, 60.0),
        ]);
        let (region, _) = pipeline.extract_primary(&textured_image(120, 120, 4)).unwrap();
        assert_eq!(region.x, 40.0);
    }

    #[test]
    fn test_extract_all_returns_every_face() {
        let mut pipeline = pipeline_with(vec![
            BoundingBox::new(0.0, 0.0, 60.0, 60.0),
            BoundingBox::new(60.0, 60.0, 60.0, 60.0),
            BoundingBox::new(0.0, 100.0, 10.0, 10.0),
        ]);
        let probes = pipeline.extract_all(&textured_image(120, 120, 2)).unwrap();
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[1].0.x, 60.0);
    }

    #[test]
    fn test_extract_all_empty_is_ok() {
        let mut pipeline = pipeline_with(Vec::new());
        assert!(pipeline.extract_all(&textured_image(64, 64, 2)).unwrap().is_empty());
    }

    #[test]
    fn test_auto_without_models_falls_back_to_full_frame() {
        let dir = tempfile::tempdir().unwrap();
        let models = ModelPaths::in_dir(dir.path());
        let pipeline = FacePipeline::select(StrategyPreference::Auto, &models, &PixelConfig::default(), 50).unwrap();
        assert_eq!(pipeline.kind(), ExtractorKind::Pixel);
        assert_eq!(pipeline.detector_name(), "full-frame");
    }

    #[test]
    fn test_forced_embedding_without_models_fails() {
        let dir = tempfile::tempdir().unwrap();
        let models = ModelPaths::in_dir(dir.path());
        let result = FacePipeline::select(StrategyPreference::Embedding, &models, &PixelConfig::default(), 50);
        assert!(matches!(result, Err(StrategyError::EmbeddingUnavailable(_))));
    }

    #[test]
    fn test_strategy_preference_parsing() {
        assert_eq!("Pixel".parse::<StrategyPreference>().unwrap(), StrategyPreference::Pixel);
        assert_eq!(" auto ".parse::<StrategyPreference>().unwrap(), StrategyPreference::Auto);
        assert!("dlib".parse::<StrategyPreference>().is_err());
    }
}
