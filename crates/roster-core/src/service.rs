//! The in-process interface the operator surface talks to, plus the
//! collaborator traits for cameras and audio feedback.

use crate::attendance::{AttendanceError, AttendanceGate, AttendancePolicy, AttendanceStore, StoreError};
use crate::gallery::{GalleryConfig, GalleryEntry, GalleryStore, RegistrationError, StorageError};
use crate::matcher::{MatchConfig, MatchEngine};
use crate::pipeline::{FaceError, FacePipeline, ModelPaths, StrategyError, StrategyPreference};
use crate::pixel::PixelConfig;
use crate::types::{ExtractorKind, MatchResult};
use chrono::{NaiveDateTime, Timelike};
use image::DynamicImage;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("capture timed out after {0} ms")]
    CaptureTimeout(u64),
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A source of still images, typically a camera.
pub trait ImageSource {
    fn capture(&mut self) -> Result<DynamicImage, CaptureError>;
}

/// Fire-and-forget audio feedback. Implementations must not block on
/// playback and swallow their own failures.
pub trait Announcer {
    fn announce(&self, message: &str);
}

/// Announces nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Announcer for Silent {
    fn announce(&self, _message: &str) {}
}

/// Time-of-day greeting for a 24-hour clock hour.
pub fn greeting(hour: u32) -> &'static str {
    match hour {
        5..=11 => "Good morning",
        12..=16 => "Good afternoon",
        17..=20 => "Good evening",
        _ => "Good night",
    }
}

/// What happened to one recognized face during check-in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckInOutcome {
    Recorded {
        identity: String,
        record_id: i64,
        is_late: bool,
        is_duplicate: bool,
        confidence: f32,
    },
    AlreadyMarked {
        identity: String,
    },
    Unrecognized {
        confidence: f32,
    },
}

/// Everything needed to assemble a [`RosterService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub gallery_dir: PathBuf,
    pub models: ModelPaths,
    pub strategy: StrategyPreference,
    pub gallery: GalleryConfig,
    pub matching: MatchConfig,
    pub pixel: PixelConfig,
    pub attendance: AttendancePolicy,
}

pub struct RosterService {
    gallery: GalleryStore,
    engine: MatchEngine,
    gate: AttendanceGate,
    store: Box<dyn AttendanceStore>,
    announcer: Box<dyn Announcer>,
}

impl RosterService {
    /// Select the face pipeline, open the gallery and load it.
    pub fn open(
        config: &ServiceConfig,
        store: Box<dyn AttendanceStore>,
        announcer: Box<dyn Announcer>,
    ) -> Result<Self, ServiceError> {
        let pipeline = FacePipeline::select(
            config.strategy,
            &config.models,
            &config.pixel,
            config.gallery.min_face_size,
        )?;
        let gallery = GalleryStore::open(&config.gallery_dir, pipeline, &config.gallery)?;

        let mut service = Self::new(
            gallery,
            &config.matching,
            AttendanceGate::new(config.attendance.clone()),
            store,
            announcer,
        );
        service.reload()?;
        Ok(service)
    }

    /// Assemble from parts. The match metric follows the gallery's strategy.
    pub fn new(
        gallery: GalleryStore,
        matching: &MatchConfig,
        gate: AttendanceGate,
        store: Box<dyn AttendanceStore>,
        announcer: Box<dyn Announcer>,
    ) -> Self {
        let engine = MatchEngine::for_kind(gallery.kind(), matching);
        Self {
            gallery,
            engine,
            gate,
            store,
            announcer,
        }
    }

    pub fn gallery(&self) -> &GalleryStore {
        &self.gallery
    }

    pub fn kind(&self) -> ExtractorKind {
        self.gallery.kind()
    }

    pub fn register(&mut self, identity: &str, image: &DynamicImage) -> Result<GalleryEntry, RegistrationError> {
        self.gallery.register(identity, image)
    }

    /// One result per acceptable face. An empty gallery short-circuits
    /// before detection; an image without faces yields no results.
    pub fn recognize(&mut self, image: &DynamicImage) -> Result<Vec<MatchResult>, FaceError> {
        if self.gallery.is_empty() {
            tracing::info!("no known faces loaded, skipping recognition");
            return Ok(Vec::new());
        }

        let gray = image.to_luma8();
        let probes = self.gallery.pipeline_mut().extract_all(&gray)?;
        let results = self.engine.identify(&probes, self.gallery.entries());

        tracing::info!(
            faces = results.len(),
            recognized = results.iter().filter(|r| r.is_confident).count(),
            "recognition complete"
        );
        Ok(results)
    }

    /// Capture and recognize. A failed capture is logged and reported as no faces.
    pub fn recognize_from(&mut self, source: &mut dyn ImageSource) -> Result<Vec<MatchResult>, FaceError> {
        match source.capture() {
            Ok(image) => self.recognize(&image),
            Err(e) => {
                tracing::warn!(error = %e, "capture failed, reporting no faces");
                Ok(Vec::new())
            }
        }
    }

    /// Identities in gallery order.
    pub fn list_identities(&self) -> Vec<String> {
        self.gallery.identities()
    }

    pub fn remove(&mut self, identity: &str) -> Result<usize, StorageError> {
        self.gallery.delete(identity)
    }

    /// Load the gallery (cache when valid); returns the entry count.
    pub fn reload(&mut self) -> Result<usize, StorageError> {
        Ok(self.gallery.load()?.len())
    }

    /// Discard the cache and re-extract every source image.
    pub fn rebuild(&mut self) -> Result<usize, StorageError> {
        Ok(self.gallery.rebuild()?.len())
    }

    /// Recognize, then run every face through the attendance gate and
    /// announce the outcome. Announcements never affect the result.
    pub fn check_in(&mut self, image: &DynamicImage, now: NaiveDateTime) -> Result<Vec<CheckInOutcome>, ServiceError> {
        let results = self.recognize(image)?;

        let mut outcomes = Vec::with_capacity(results.len());
        for result in &results {
            let outcome = match self.gate.check_in(result, now, self.store.as_mut()) {
                Ok(recorded) => CheckInOutcome::Recorded {
                    identity: recorded.decision.identity,
                    record_id: recorded.record_id,
                    is_late: recorded.decision.is_late,
                    is_duplicate: recorded.decision.is_duplicate,
                    confidence: recorded.decision.confidence,
                },
                Err(AttendanceError::AlreadyMarked { identity, .. }) => CheckInOutcome::AlreadyMarked { identity },
                Err(AttendanceError::NotRecognized) => CheckInOutcome::Unrecognized {
                    confidence: result.confidence,
                },
                Err(AttendanceError::Store(e)) => return Err(e.into()),
            };

            if let Some(message) = announcement(&outcome, now) {
                self.announcer.announce(&message);
            }
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Capture, then [`check_in`](Self::check_in). A failed capture is
    /// logged and yields no outcomes.
    pub fn check_in_from(
        &mut self,
        source: &mut dyn ImageSource,
        now: NaiveDateTime,
    ) -> Result<Vec<CheckInOutcome>, ServiceError> {
        match source.capture() {
            Ok(image) => self.check_in(&image, now),
            Err(e) => {
                tracing::warn!(error = %e, "capture failed, no check-in this round");
                Ok(Vec::new())
            }
        }
    }
}

fn announcement(outcome: &CheckInOutcome, now: NaiveDateTime) -> Option<String> {
    let greeting = greeting(now.hour());
    match outcome {
        CheckInOutcome::Recorded {
            identity, is_late: true, ..
        } => Some(format!(
            "{greeting} {identity}! Your attendance has been marked. You are late today."
        )),
        CheckInOutcome::Recorded { identity, .. } => Some(format!(
            "{greeting} {identity}! Welcome! Your attendance has been marked successfully."
        )),
        CheckInOutcome::AlreadyMarked { identity } => Some(format!(
            "{greeting} {identity}! Your attendance is already recorded for today."
        )),
        CheckInOutcome::Unrecognized { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{FaceDetector, FullFrameDetector};
    use crate::pixel::PixelExtractor;
    use crate::testing::{
        textured_image, FixedDetector, MemoryAttendanceStore, RecordingAnnouncer, ScriptedDetector, ScriptedSource,
    };
    use crate::types::BoundingBox;
    use chrono::NaiveDate;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        service: RosterService,
        announcer: RecordingAnnouncer,
    }

    fn harness(store: MemoryAttendanceStore) -> Harness {
        harness_with(Box::new(FullFrameDetector), store)
    }

    fn harness_with(detector: Box<dyn FaceDetector>, store: MemoryAttendanceStore) -> Harness {
        let dir = TempDir::new().unwrap();
        let pipeline = FacePipeline::new(detector, Box::new(PixelExtractor::new(32)), 50);
        let mut gallery = GalleryStore::open(dir.path(), pipeline, &GalleryConfig::default()).unwrap();
        gallery.load().unwrap();

        let announcer = RecordingAnnouncer::default();
        let service = RosterService::new(
            gallery,
            &MatchConfig::default(),
            AttendanceGate::default(),
            Box::new(store),
            Box::new(announcer.clone()),
        );
        Harness {
            _dir: dir,
            service,
            announcer,
        }
    }

    fn face(seed: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(textured_image(80, 80, seed))
    }

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_greeting_bands() {
        assert_eq!(greeting(4), "Good night");
        assert_eq!(greeting(5), "Good morning");
        assert_eq!(greeting(11), "Good morning");
        assert_eq!(greeting(12), "Good afternoon");
        assert_eq!(greeting(17), "Good evening");
        assert_eq!(greeting(21), "Good night");
    }

    #[test]
    fn test_register_then_recognize_same_image() {
        let mut h = harness(MemoryAttendanceStore::default());
        h.service.register("Alice", &face(1)).unwrap();
        h.service.register("Bob", &face(2)).unwrap();

        let results = h.service.recognize(&face(1)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].identity.as_deref(), Some("Alice"));
        assert!(results[0].confidence > 0.6);
    }

    #[test]
    fn test_unregistered_face_is_unknown() {
        let mut h = harness(MemoryAttendanceStore::default());
        h.service.register("Alice", &face(1)).unwrap();

        let results = h.service.recognize(&face(7)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].label(), "Unknown");
    }

    #[test]
    fn test_empty_gallery_recognizes_nothing() {
        let mut h = harness(MemoryAttendanceStore::default());
        assert!(h.service.recognize(&face(1)).unwrap().is_empty());
    }

    #[test]
    fn test_removed_identity_never_matches() {
        let mut h = harness(MemoryAttendanceStore::default());
        h.service.register("Alice", &face(1)).unwrap();
        h.service.register("Bob", &face(2)).unwrap();

        assert_eq!(h.service.remove("Alice").unwrap(), 1);
        assert_eq!(h.service.list_identities(), vec!["Bob"]);
        let results = h.service.recognize(&face(1)).unwrap();
        assert!(results.iter().all(|r| r.identity.as_deref() != Some("Alice")));

        h.service.reload().unwrap();
        assert_eq!(h.service.list_identities(), vec!["Bob"]);
    }

    #[test]
    fn test_reregistration_recognizes_new_image() {
        let mut h = harness(MemoryAttendanceStore::default());
        h.service.register("Alice", &face(1)).unwrap();
        h.service.register("Alice", &face(3)).unwrap();

        let results = h.service.recognize(&face(3)).unwrap();
        assert_eq!(results[0].identity.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_check_in_records_and_announces() {
        let mut h = harness(MemoryAttendanceStore::default());
        h.service.register("Alice", &face(1)).unwrap();

        let outcomes = h.service.check_in(&face(1), at(9, 5)).unwrap();
        assert!(matches!(
            &outcomes[..],
            [CheckInOutcome::Recorded { identity, record_id: 1, is_late: false, .. }] if identity == "Alice"
        ));

        let again = h.service.check_in(&face(1), at(9, 30)).unwrap();
        assert!(matches!(&again[..], [CheckInOutcome::AlreadyMarked { .. }]));

        let messages = h.announcer.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("Good morning Alice!"));
        assert!(messages[1].contains("already recorded"));
    }

    #[test]
    fn test_check_in_unknown_face_is_silent() {
        let mut h = harness(MemoryAttendanceStore::default());
        h.service.register("Alice", &face(1)).unwrap();

        let outcomes = h.service.check_in(&face(9), at(9, 0)).unwrap();
        assert!(matches!(&outcomes[..], [CheckInOutcome::Unrecognized { .. }]));
        assert!(h.announcer.messages().is_empty());
    }

    #[test]
    fn test_check_in_store_failure_surfaces() {
        let mut h = harness(MemoryAttendanceStore {
            unavailable: true,
            ..Default::default()
        });
        h.service.register("Alice", &face(1)).unwrap();

        let err = h.service.check_in(&face(1), at(9, 0)).unwrap_err();
        assert!(matches!(err, ServiceError::Store(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_capture_failure_degrades_to_nothing() {
        let mut h = harness(MemoryAttendanceStore::default());
        h.service.register("Alice", &face(1)).unwrap();

        let mut source = ScriptedSource::default();
        source.frames.push_back(Err(CaptureError::CaptureTimeout(2000)));
        source.frames.push_back(Ok(face(1)));

        assert!(h.service.check_in_from(&mut source, at(9, 0)).unwrap().is_empty());
        assert_eq!(h.service.check_in_from(&mut source, at(9, 0)).unwrap().len(), 1);
        assert!(h.service.recognize_from(&mut source).unwrap().is_empty());
    }

    fn stored_images(h: &Harness) -> usize {
        std::fs::read_dir(h.service.gallery().dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "jpg"))
            .count()
    }

    #[test]
    fn test_blurry_registration_changes_nothing() {
        let mut h = harness(MemoryAttendanceStore::default());
        let blank = DynamicImage::ImageLuma8(GrayImage::from_pixel(80, 80, Luma([120])));
        match h.service.register("Alice", &blank) {
            Err(RegistrationError::PoorImageQuality(reason)) => assert!(reason.starts_with("too blurry")),
            other => panic!("expected PoorImageQuality, got {other:?}"),
        }
        assert!(h.service.list_identities().is_empty());
        assert_eq!(stored_images(&h), 0);
    }

    #[test]
    fn test_no_face_registration_changes_nothing() {
        let mut h = harness_with(Box::new(FixedDetector::new(vec![])), MemoryAttendanceStore::default());
        assert!(matches!(
            h.service.register("Alice", &face(1)),
            Err(RegistrationError::Face(FaceError::NoFaceFound))
        ));
        assert!(h.service.list_identities().is_empty());
        assert_eq!(stored_images(&h), 0);
    }

    #[test]
    fn test_recognize_without_face_is_empty_not_error() {
        // One face while registering, none afterwards
        let detector = ScriptedDetector::new(vec![vec![BoundingBox::new(0.0, 0.0, 80.0, 80.0)]]);
        let mut h = harness_with(Box::new(detector), MemoryAttendanceStore::default());
        h.service.register("Alice", &face(1)).unwrap();
        assert_eq!(h.service.gallery().len(), 1);

        let results = h.service.recognize(&face(1)).unwrap();
        assert!(results.is_empty());
        assert!(h.announcer.messages().is_empty());
    }

    #[test]
    fn test_open_falls_back_to_pixel_without_models() {
        let dir = TempDir::new().unwrap();
        let config = ServiceConfig {
            gallery_dir: dir.path().join("gallery"),
            models: ModelPaths::in_dir(&dir.path().join("models")),
            strategy: StrategyPreference::Auto,
            gallery: GalleryConfig::default(),
            matching: MatchConfig::default(),
            pixel: PixelConfig::default(),
            attendance: AttendancePolicy::default(),
        };
        let service = RosterService::open(
            &config,
            Box::new(MemoryAttendanceStore::default()),
            Box::new(Silent),
        )
        .unwrap();
        assert_eq!(service.kind(), ExtractorKind::Pixel);
        assert!(service.gallery().dir().exists());
    }
}
