//! Registration-time image quality checks: Laplacian blur variance and mean brightness.
//!
//! Only registration consults the gate; live recognition frames are never rejected here.

use image::GrayImage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Minimum variance of the Laplacian response; below this the image is too blurry.
    pub min_blur_variance: f64,
    pub min_brightness: f64,
    pub max_brightness: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_blur_variance: 30.0,
            min_brightness: 50.0,
            max_brightness: 200.0,
        }
    }
}

/// Measured quality of one image plus the verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityReport {
    pub blur_variance: f64,
    pub brightness: f64,
    /// `None` when acceptable, otherwise the human-readable rejection reason.
    pub rejection: Option<String>,
}

impl QualityReport {
    pub fn is_acceptable(&self) -> bool {
        self.rejection.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Blur is checked before brightness; the first failing check names the reason.
    pub fn assess(&self, gray: &GrayImage) -> QualityReport {
        let blur_variance = laplacian_variance(gray);
        let brightness = mean_brightness(gray);

        let rejection = if blur_variance < self.config.min_blur_variance {
            Some(format!("too blurry (sharpness {blur_variance:.1})"))
        } else if brightness < self.config.min_brightness {
            Some(format!("too dark (brightness {brightness:.1})"))
        } else if brightness > self.config.max_brightness {
            Some(format!("too bright (brightness {brightness:.1})"))
        } else {
            None
        };

        tracing::debug!(blur_variance, brightness, ?rejection, "assessed image quality");

        QualityReport {
            blur_variance,
            brightness,
            rejection,
        }
    }
}

/// Mean pixel intensity in [0, 255]; 0 for an empty image.
pub fn mean_brightness(gray: &GrayImage) -> f64 {
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    pixels.iter().map(|&p| p as u64).sum::<u64>() as f64 / pixels.len() as f64
}

/// Variance of the 4-neighbour Laplacian `[0 1 0; 1 -4 1; 0 1 0]`,
/// with the border mirrored without repeating the edge pixel (`dcb|abcd|cba`).
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }

    let at = |x: i64, y: i64| -> f64 { gray.get_pixel(reflect_101(x, w), reflect_101(y, h))[0] as f64 };

    let n = (w as u64 * h as u64) as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let response = at(x, y - 1) + at(x - 1, y) + at(x + 1, y) + at(x, y + 1) - 4.0 * at(x, y);
            sum += response;
            sum_sq += response * response;
        }
    }

    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Mirror an index one step outside `0..len` back inside: -1 maps to 1
/// and `len` to `len - 2`.
fn reflect_101(i: i64, len: u32) -> u32 {
    let last = len as i64 - 1;
    if last == 0 {
        return 0;
    }
    let mirrored = if i < 0 {
        -i
    } else if i > last {
        2 * last - i
    } else {
        i
    };
    mirrored.clamp(0, last) as u32
}
