//! Model-free test doubles.

use crate::attendance::{AttendanceDecision, AttendanceStore, StoreError};
use crate::detector::{ensure_not_empty, DetectorError, FaceDetector};
use crate::service::{Announcer, CaptureError, ImageSource};
use crate::types::BoundingBox;
use chrono::NaiveDate;
use image::{DynamicImage, GrayImage, Luma};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Deterministic noise in [60, 190]: sharp enough and mid-bright enough to
/// pass the quality gate; different seeds give uncorrelated images.
pub fn textured_image(width: u32, height: u32, seed: u32) -> GrayImage {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(0x9E37_79B9) | 1;
    GrayImage::from_fn(width, height, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        Luma([60 + (state % 131) as u8])
    })
}

/// Returns the same boxes for every image.
pub struct FixedDetector {
    boxes: Vec<BoundingBox>,
}

impl FixedDetector {
    pub fn new(boxes: Vec<BoundingBox>) -> Self {
        Self { boxes }
    }
}

impl FaceDetector for FixedDetector {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        ensure_not_empty(image)?;
        Ok(self.boxes.clone())
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Hands out one scripted box list per call, then finds nothing.
pub struct ScriptedDetector {
    calls: VecDeque<Vec<BoundingBox>>,
}

impl ScriptedDetector {
    pub fn new(calls: Vec<Vec<BoundingBox>>) -> Self {
        Self { calls: calls.into() }
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        ensure_not_empty(image)?;
        Ok(self.calls.pop_front().unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[derive(Default)]
pub struct MemoryAttendanceStore {
    pub records: Vec<AttendanceDecision>,
    pub unavailable: bool,
}

impl AttendanceStore for MemoryAttendanceStore {
    fn exists(&self, identity: &str, date: NaiveDate) -> Result<bool, StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("test store offline".into()));
        }
        Ok(self.records.iter().any(|r| r.identity == identity && r.date == date))
    }

    fn append(&mut self, decision: &AttendanceDecision) -> Result<i64, StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("test store offline".into()));
        }
        self.records.push(decision.clone());
        Ok(self.records.len() as i64)
    }
}

/// Keeps every announcement; clones share the log.
#[derive(Clone, Default)]
pub struct RecordingAnnouncer {
    pub messages: Arc<Mutex<Vec<String>>>,
}

impl RecordingAnnouncer {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl Announcer for RecordingAnnouncer {
    fn announce(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}

/// Plays back queued captures, then reports the camera as unavailable.
#[derive(Default)]
pub struct ScriptedSource {
    pub frames: VecDeque<Result<DynamicImage, CaptureError>>,
}

impl ImageSource for ScriptedSource {
    fn capture(&mut self) -> Result<DynamicImage, CaptureError> {
        self.frames
            .pop_front()
            .unwrap_or_else(|| Err(CaptureError::CameraUnavailable("script exhausted".into())))
    }
}
