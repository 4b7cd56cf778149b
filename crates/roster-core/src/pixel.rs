//! Handcrafted pixel-intensity features.
//!
//! Crop the face, resize to a fixed square, equalize the histogram, flatten
//! and scale to [0, 1]. No model files involved.

use crate::alignment;
use crate::extractor::{ExtractError, FeatureExtractor};
use crate::types::{BoundingBox, ExtractorKind, FeatureVector};
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Side of the square face crop; vectors have `size * size` elements.
pub const DEFAULT_PIXEL_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PixelConfig {
    pub size: u32,
}

impl Default for PixelConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_PIXEL_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PixelExtractor {
    size: u32,
}

impl PixelExtractor {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

impl Default for PixelExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_PIXEL_SIZE)
    }
}

impl FeatureExtractor for PixelExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Pixel
    }

    fn signature(&self) -> String {
        format!("pixel-eq-{}x{}", self.size, self.size)
    }

    fn extract(&mut self, image: &GrayImage, region: &BoundingBox) -> Result<FeatureVector, ExtractError> {
        let mut face = alignment::crop_and_resize(image, region, self.size)
            .ok_or_else(|| ExtractError::EncodingFailed("face region lies outside the image".into()))?;

        equalize_histogram(&mut face);

        let values = face.as_raw().iter().map(|&p| p as f32 / 255.0).collect();
        Ok(FeatureVector::new(ExtractorKind::Pixel, values))
    }
}

/// Global histogram equalization, in place.
///
/// Maps each level through the normalized CDF so the darkest occupied level
/// becomes 0 and the brightest 255. Single-valued images are left untouched.
pub fn equalize_histogram(gray: &mut GrayImage) {
    let total = gray.as_raw().len();
    if total == 0 {
        return;
    }

    let mut hist = [0usize; 256];
    for &p in gray.as_raw() {
        hist[p as usize] += 1;
    }

    let Some(first) = hist.iter().position(|&c| c > 0) else {
        return;
    };
    let cdf_min = hist[first];
    if cdf_min == total {
        return;
    }

    let scale = 255.0 / (total - cdf_min) as f32;
    let mut lut = [0u8; 256];
    let mut cdf = 0usize;
    for (level, &count) in hist.iter().enumerate() {
        cdf += count;
        if level >= first {
            lut[level] = ((cdf - cdf_min) as f32 * scale).round().clamp(0.0, 255.0) as u8;
        }
    }

    for p in gray.pixels_mut() {
        p[0] = lut[p[0] as usize];
    }
}
