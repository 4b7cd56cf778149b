//! Gallery matching: per-strategy metrics and the ranked accept/reject decision.

use crate::gallery::GalleryEntry;
use crate::types::{BoundingBox, ExtractorKind, FeatureVector, MatchResult};
use serde::{Deserialize, Serialize};

/// Fused-score weights: inverse Euclidean, cosine similarity, correlation.
const FUSED_WEIGHT_INVERSE_EUCLIDEAN: f32 = 0.3;
const FUSED_WEIGHT_COSINE: f32 = 0.4;
const FUSED_WEIGHT_CORRELATION: f32 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Maximum normalized Euclidean distance accepted for embedding vectors.
    ///
    /// For unit vectors and a span of 2.0, a tolerance `t` accepts cosine
    /// similarity down to `1 - 2t²`. The 0.6 default therefore admits
    /// cosine ≈ 0.28, well below the 0.40 usually used as an ArcFace cut;
    /// set ≈ 0.548 to reproduce that.
    pub tolerance: f32,
    /// Divisor bringing raw embedding distances into [0, 1]. Unit vectors span [0, 2].
    pub embedding_distance_span: f32,
    /// Minimum fused score accepted for pixel vectors.
    pub fused_threshold: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.6,
            embedding_distance_span: 2.0,
            fused_threshold: 0.6,
        }
    }
}

/// Distance between a probe and one gallery vector, with the derived confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    /// Smaller is closer. Ranking uses this for every metric.
    pub distance: f32,
    /// Match strength in [0, 1].
    pub confidence: f32,
}

/// Strategy for scoring a probe against one gallery vector.
pub trait Matcher {
    /// `None` when the two vectors are not comparable (different kind or length).
    fn compare(&self, probe: &FeatureVector, candidate: &FeatureVector) -> Option<Comparison>;

    /// Whether the comparison clears the acceptance threshold.
    fn accepts(&self, comparison: &Comparison) -> bool;
}

/// Euclidean distance scaled by `span`, accepted at or under `tolerance`.
///
/// Confidence is `1 - distance` clamped to [0, 1]; the decision itself uses
/// the unclamped distance.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f32,
    pub span: f32,
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &FeatureVector, candidate: &FeatureVector) -> Option<Comparison> {
        if !probe.is_comparable(candidate) {
            return None;
        }
        let span = if self.span > 0.0 { self.span } else { 1.0 };
        let distance = probe.euclidean_distance(candidate) / span;
        Some(Comparison {
            distance,
            confidence: (1.0 - distance).clamp(0.0, 1.0),
        })
    }

    fn accepts(&self, comparison: &Comparison) -> bool {
        comparison.distance <= self.tolerance
    }
}

/// Weighted blend of inverse Euclidean distance, cosine similarity and
/// correlation, each clamped to [0, 1]. The fused score is the confidence.
#[derive(Debug, Clone, Copy)]
pub struct FusedMatcher {
    pub threshold: f32,
}

impl FusedMatcher {
    pub fn score(probe: &FeatureVector, candidate: &FeatureVector) -> f32 {
        let inverse_euclidean = 1.0 / (1.0 + probe.euclidean_distance(candidate));
        let cosine = probe.cosine_similarity(candidate).clamp(0.0, 1.0);
        let correlation = probe.correlation(candidate).clamp(0.0, 1.0);

        FUSED_WEIGHT_INVERSE_EUCLIDEAN * inverse_euclidean.clamp(0.0, 1.0)
            + FUSED_WEIGHT_COSINE * cosine
            + FUSED_WEIGHT_CORRELATION * correlation
    }
}

impl Matcher for FusedMatcher {
    fn compare(&self, probe: &FeatureVector, candidate: &FeatureVector) -> Option<Comparison> {
        if !probe.is_comparable(candidate) {
            return None;
        }
        let score = Self::score(probe, candidate).clamp(0.0, 1.0);
        Some(Comparison {
            distance: 1.0 - score,
            confidence: score,
        })
    }

    fn accepts(&self, comparison: &Comparison) -> bool {
        comparison.confidence >= self.threshold
    }
}

/// Applies one matcher across a gallery.
pub struct MatchEngine {
    matcher: Box<dyn Matcher>,
}

impl MatchEngine {
    pub fn new(matcher: Box<dyn Matcher>) -> Self {
        Self { matcher }
    }

    /// The native metric for vectors of `kind`: Euclidean for embeddings,
    /// fused score for pixel features.
    pub fn for_kind(kind: ExtractorKind, config: &MatchConfig) -> Self {
        let matcher: Box<dyn Matcher> = match kind {
            ExtractorKind::Embedding => Box::new(EuclideanMatcher {
                tolerance: config.tolerance,
                span: config.embedding_distance_span,
            }),
            ExtractorKind::Pixel => Box::new(FusedMatcher {
                threshold: config.fused_threshold,
            }),
        };
        Self::new(matcher)
    }

    /// Nearest gallery entry to `probe`, with its comparison.
    ///
    /// Every entry is scored; only a strictly smaller distance replaces the
    /// current best, so the earliest entry wins ties.
    pub fn nearest<'a>(
        &self,
        probe: &FeatureVector,
        gallery: &'a [GalleryEntry],
    ) -> Option<(&'a GalleryEntry, Comparison)> {
        let mut best: Option<(&GalleryEntry, Comparison)> = None;

        for entry in gallery {
            let Some(comparison) = self.matcher.compare(probe, &entry.vector) else {
                tracing::debug!(identity = %entry.identity, "skipping incomparable gallery vector");
                continue;
            };
            let is_better = match &best {
                None => true,
                Some((_, prev)) => comparison.distance < prev.distance,
            };
            if is_better {
                best = Some((entry, comparison));
            }
        }

        best
    }

    /// Match one probe vector found at `region`.
    pub fn match_one(&self, probe: &FeatureVector, region: &BoundingBox, gallery: &[GalleryEntry]) -> MatchResult {
        match self.nearest(probe, gallery) {
            Some((entry, comparison)) => {
                let accepted = self.matcher.accepts(&comparison);
                tracing::debug!(
                    nearest = %entry.identity,
                    distance = comparison.distance,
                    confidence = comparison.confidence,
                    accepted,
                    "matched probe"
                );
                MatchResult {
                    identity: accepted.then(|| entry.identity.clone()),
                    confidence: comparison.confidence,
                    distance: comparison.distance,
                    is_confident: accepted,
                    region: region.clone(),
                }
            }
            None => MatchResult {
                identity: None,
                confidence: 0.0,
                distance: f32::INFINITY,
                is_confident: false,
                region: region.clone(),
            },
        }
    }

    /// One result per probe, in probe order, without cross-probe deduplication.
    ///
    /// An empty gallery yields no results and computes no distances.
    pub fn identify(&self, probes: &[(BoundingBox, FeatureVector)], gallery: &[GalleryEntry]) -> Vec<MatchResult> {
        if gallery.is_empty() {
            tracing::info!("no known faces loaded");
            return Vec::new();
        }

        probes
            .iter()
            .map(|(region, probe)| self.match_one(probe, region, gallery))
            .collect()
    }
}
