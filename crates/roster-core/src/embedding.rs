//! ArcFace embedding extractor via ONNX Runtime.
//!
//! Produces 512-dimensional unit-length embeddings from aligned face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::extractor::{ExtractError, FeatureExtractor};
use crate::types::{BoundingBox, ExtractorKind, FeatureVector};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

// Symmetric normalization, unlike SCRFD's 128.0 std
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// ArcFace-based embedding extractor.
pub struct ArcFaceExtractor {
    session: Session,
}

impl ArcFaceExtractor {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ExtractError> {
        if !model_path.exists() {
            return Err(ExtractError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Preprocess a 112x112 grayscale face crop into a NCHW float tensor.
    fn preprocess(aligned_face: &GrayImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in aligned_face.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            let normalized = (pixel[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            // Grayscale → 3-channel: replicate Y
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }

        tensor
    }
}

impl FeatureExtractor for ArcFaceExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Embedding
    }

    fn signature(&self) -> String {
        format!("arcface-{ARCFACE_MODEL_VERSION}-{ARCFACE_EMBEDDING_DIM}")
    }

    /// Align the face to the canonical 112x112 crop, embed, and L2-normalize.
    ///
    /// Faces without landmarks are cropped and resized instead of aligned.
    fn extract(&mut self, image: &GrayImage, region: &BoundingBox) -> Result<FeatureVector, ExtractError> {
        let aligned = match region.landmarks.as_ref() {
            Some(landmarks) => alignment::align_face(image, landmarks),
            None => {
                tracing::debug!("face has no landmarks, using unaligned crop");
                alignment::crop_and_resize(image, region, ALIGNED_SIZE).ok_or_else(|| {
                    ExtractError::EncodingFailed("face region lies outside the image".into())
                })?
            }
        };

        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::EncodingFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ExtractError::EncodingFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= 0.0 || !norm.is_finite() {
            return Err(ExtractError::EncodingFailed("degenerate embedding".into()));
        }

        Ok(FeatureVector::new(
            ExtractorKind::Embedding,
            raw.iter().map(|x| x / norm).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = GrayImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, image::Luma([128]));
        let tensor = ArcFaceExtractor::preprocess(&aligned);
        let size = ALIGNED_SIZE as usize;
        assert_eq!(tensor.shape(), &[1, 3, size, size]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let aligned = GrayImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, image::Luma([128]));
        let tensor = ArcFaceExtractor::preprocess(&aligned);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        let val = tensor[[0, 0, 0, 0]];
        assert!((val - expected).abs() < 1e-6, "got {val}, expected {expected}");
    }

    #[test]
    fn test_preprocess_channels_identical() {
        let aligned = GrayImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| image::Luma([((x + y) % 256) as u8]));
        let tensor = ArcFaceExtractor::preprocess(&aligned);
        for y in 0..ALIGNED_SIZE as usize {
            for x in 0..ALIGNED_SIZE as usize {
                assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
                assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
            }
        }
    }

    #[test]
    fn test_load_missing_model() {
        let result = ArcFaceExtractor::load(Path::new("/nonexistent/w600k_r50.onnx"));
        assert!(matches!(result, Err(ExtractError::ModelNotFound(_))));
    }
}
