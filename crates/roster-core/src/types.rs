use serde::{Deserialize, Serialize};
use std::fmt;

/// Label reported for a face that did not clear the acceptance threshold.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are in pixels of the source image, `(x, y)` being the top-left corner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// A landmark-free box with full detector confidence.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
            landmarks: None,
        }
    }

    /// Length of the shorter side.
    pub fn min_side(&self) -> f32 {
        self.width.min(self.height)
    }

    /// Intersect with a `width`×`height` image and return the integer crop
    /// rectangle `(x, y, w, h)`, or `None` when nothing of the box is inside.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.floor().max(0.0);
        let y0 = self.y.floor().max(0.0);
        let x1 = (self.x + self.width).ceil().min(width as f32);
        let y1 = (self.y + self.height).ceil().min(height as f32);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

/// Which extraction strategy produced a feature vector.
///
/// Vectors of different kinds are never compared; each kind has its own cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// Learned ArcFace embedding (unit length).
    Embedding,
    /// Equalized pixel intensities scaled to [0, 1].
    Pixel,
}

impl ExtractorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractorKind::Embedding => "embedding",
            ExtractorKind::Pixel => "pixel",
        }
    }
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-length face feature vector, tagged with the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub kind: ExtractorKind,
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(kind: ExtractorKind, values: Vec<f32>) -> Self {
        Self { kind, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Two vectors can be compared only if the same strategy produced both
    /// and they have the same non-zero length.
    pub fn is_comparable(&self, other: &FeatureVector) -> bool {
        self.kind == other.kind && self.len() == other.len() && !self.is_empty()
    }

    /// Euclidean (L2) distance.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.
    pub fn cosine_similarity(&self, other: &FeatureVector) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Pearson correlation coefficient in [-1, 1].
    ///
    /// Accumulates in f64: pixel vectors run to 10k elements. A constant
    /// vector has no defined correlation and compares as 0.
    pub fn correlation(&self, other: &FeatureVector) -> f32 {
        let n = self.len().min(other.len());
        if n == 0 {
            return 0.0;
        }

        let mean_a = self.values[..n].iter().map(|&v| v as f64).sum::<f64>() / n as f64;
        let mean_b = other.values[..n].iter().map(|&v| v as f64).sum::<f64>() / n as f64;

        let mut cov = 0.0f64;
        let mut var_a = 0.0f64;
        let mut var_b = 0.0f64;
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let da = *a as f64 - mean_a;
            let db = *b as f64 - mean_b;
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }

        let denom = (var_a * var_b).sqrt();
        if denom > 0.0 { (cov / denom) as f32 } else { 0.0 }
    }
}

/// Result of matching one detected face against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Matched identity, `None` when no entry cleared the threshold.
    pub identity: Option<String>,
    /// Match strength in [0, 1] of the nearest entry, even when rejected.
    pub confidence: f32,
    /// Distance to the nearest entry in the matcher's native metric.
    pub distance: f32,
    pub is_confident: bool,
    /// Face region in the probe image.
    pub region: BoundingBox,
}

impl MatchResult {
    /// The matched identity, or [`UNKNOWN_IDENTITY`].
    pub fn label(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_IDENTITY)
    }
}
