//! The kiosk camera as an [`ImageSource`].

use image::{DynamicImage, GrayImage};
use roster_core::{CaptureError, ImageSource};
use roster_hw::{Camera, CameraError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub warmup_frames: usize,
    pub timeout: Duration,
}

/// Opens the device on first capture and reopens it after a failure.
pub struct CameraSource {
    settings: CameraSettings,
    camera: Option<Camera>,
}

impl CameraSource {
    pub fn new(settings: CameraSettings) -> Self {
        Self { settings, camera: None }
    }

    fn camera(&mut self) -> Result<&Camera, CaptureError> {
        if self.camera.is_none() {
            let s = &self.settings;
            let camera = Camera::open(&s.device, s.width, s.height)
                .map_err(|e| CaptureError::CameraUnavailable(format!("{}: {e}", s.device)))?;
            self.camera = Some(camera);
        }
        self.camera
            .as_ref()
            .ok_or_else(|| CaptureError::CameraUnavailable(self.settings.device.clone()))
    }
}

impl ImageSource for CameraSource {
    fn capture(&mut self) -> Result<DynamicImage, CaptureError> {
        let warmup = self.settings.warmup_frames;
        let timeout = self.settings.timeout;
        let result = self.camera()?.capture_after_warmup(warmup, timeout);

        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                // Drop the handle so the next capture reopens the device
                self.camera = None;
                return Err(capture_error(e));
            }
        };

        tracing::debug!(
            seq = frame.sequence,
            brightness = frame.avg_brightness(),
            dark = frame.is_dark,
            "frame captured"
        );

        let (width, height) = (frame.width, frame.height);
        GrayImage::from_raw(width, height, frame.into_data())
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(|| CaptureError::CameraUnavailable(format!("short frame buffer for {width}x{height}")))
    }
}

fn capture_error(e: CameraError) -> CaptureError {
    match e {
        CameraError::Timeout(ms) => CaptureError::CaptureTimeout(ms),
        other => CaptureError::CameraUnavailable(other.to_string()),
    }
}
