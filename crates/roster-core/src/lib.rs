//! roster-core: face gallery matching for attendance check-in.
//!
//! Detects faces (SCRFD via ONNX Runtime, the SeetaFace cascade, or the whole
//! frame), turns them into feature vectors (ArcFace embeddings or equalized
//! pixel features), matches them against a persistent gallery and gates the
//! resulting check-ins.

pub mod alignment;
pub mod attendance;
pub mod detector;
pub mod embedding;
pub mod extractor;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod pixel;
pub mod quality;
pub mod seeta;
pub mod service;
pub mod types;

#[cfg(test)]
mod testing;

pub use attendance::{AttendanceDecision, AttendanceGate, AttendancePolicy, AttendanceStore, StoreError};
pub use gallery::{DuplicatePolicy, GalleryConfig, GalleryEntry, GalleryStore, RegistrationError, StorageError};
pub use matcher::{MatchConfig, MatchEngine};
pub use pipeline::{FaceError, FacePipeline, ModelPaths, StrategyPreference};
pub use pixel::PixelConfig;
pub use quality::QualityConfig;
pub use service::{
    greeting, Announcer, CaptureError, CheckInOutcome, ImageSource, RosterService, ServiceConfig, ServiceError, Silent,
};
pub use types::{BoundingBox, ExtractorKind, FeatureVector, MatchResult, UNKNOWN_IDENTITY};

/// Default model directory: `$XDG_DATA_HOME/roster/models`, falling back to
/// `~/.local/share/roster/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    data_dir().join("models")
}

/// Default gallery directory: `$XDG_DATA_HOME/roster/known_faces`.
pub fn default_gallery_dir() -> std::path::PathBuf {
    data_dir().join("known_faces")
}

/// Root of roster's persistent data: `$XDG_DATA_HOME/roster`, falling back
/// to `~/.local/share/roster`.
pub fn data_dir() -> std::path::PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return std::path::PathBuf::from(xdg).join("roster");
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    std::path::PathBuf::from(home).join(".local/share/roster")
}
