use anyhow::{bail, Context, Result};
use roster_core::{
    AttendancePolicy, DuplicatePolicy, GalleryConfig, MatchConfig, ModelPaths, PixelConfig, ServiceConfig,
    StrategyPreference,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::camera::CameraSettings;
use crate::speech::SpeechSettings;

/// Kiosk configuration: an optional TOML file overridden by `ROSTER_*`
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory of registered face images.
    pub gallery_dir: PathBuf,
    /// Path to the SQLite attendance database.
    pub db_path: PathBuf,
    /// Directory containing the SCRFD, ArcFace and SeetaFace model files.
    pub model_dir: PathBuf,
    pub strategy: StrategyPreference,
    /// Pause between kiosk check-in rounds.
    pub kiosk_interval_ms: u64,
    pub gallery: GalleryConfig,
    pub matching: MatchConfig,
    pub pixel: PixelConfig,
    pub attendance: AttendancePolicy,
    pub camera: CameraConfig,
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// V4L2 device path.
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Frames discarded before each capture (AGC/AE stabilization).
    pub warmup_frames: usize,
    pub capture_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enable_audio: bool,
    pub speech_program: String,
    pub speech_rate: u32,
    /// Seconds the speech worker waits for work before exiting.
    pub speech_idle_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gallery_dir: roster_core::default_gallery_dir(),
            db_path: roster_core::data_dir().join("attendance.db"),
            model_dir: roster_core::default_model_dir(),
            strategy: StrategyPreference::Auto,
            kiosk_interval_ms: 2000,
            gallery: GalleryConfig::default(),
            matching: MatchConfig::default(),
            pixel: PixelConfig::default(),
            attendance: AttendancePolicy::default(),
            camera: CameraConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            warmup_frames: 4,
            capture_timeout_ms: 2000,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        let speech = SpeechSettings::default();
        Self {
            enable_audio: true,
            speech_program: speech.program,
            speech_rate: speech.rate,
            speech_idle_secs: speech.idle_timeout.as_secs(),
        }
    }
}

impl Config {
    /// Read `path` (if given), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `ROSTER_*` variables as resolved by `lookup`.
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = env("ROSTER_GALLERY_DIR") {
            self.gallery_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ROSTER_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("ROSTER_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ROSTER_CAMERA_DEVICE") {
            self.camera.device = v;
        }
        if let Some(v) = env("ROSTER_SPEECH_PROGRAM") {
            self.audio.speech_program = v;
        }

        set_parsed(&mut self.strategy, "ROSTER_STRATEGY", env("ROSTER_STRATEGY"));
        set_parsed(&mut self.matching.tolerance, "ROSTER_FACE_TOLERANCE", env("ROSTER_FACE_TOLERANCE"));
        set_parsed(
            &mut self.matching.fused_threshold,
            "ROSTER_PIXEL_THRESHOLD",
            env("ROSTER_PIXEL_THRESHOLD"),
        );
        set_parsed(&mut self.gallery.min_face_size, "ROSTER_MIN_FACE_SIZE", env("ROSTER_MIN_FACE_SIZE"));
        set_parsed(
            &mut self.gallery.quality.min_blur_variance,
            "ROSTER_FACE_QUALITY_THRESHOLD",
            env("ROSTER_FACE_QUALITY_THRESHOLD"),
        );
        set_parsed::<DuplicatePolicy>(
            &mut self.gallery.duplicate_policy,
            "ROSTER_DUPLICATE_POLICY",
            env("ROSTER_DUPLICATE_POLICY"),
        );
        set_parsed(&mut self.camera.width, "ROSTER_CAMERA_WIDTH", env("ROSTER_CAMERA_WIDTH"));
        set_parsed(&mut self.camera.height, "ROSTER_CAMERA_HEIGHT", env("ROSTER_CAMERA_HEIGHT"));
        set_parsed(&mut self.camera.warmup_frames, "ROSTER_WARMUP_FRAMES", env("ROSTER_WARMUP_FRAMES"));
        set_parsed(
            &mut self.camera.capture_timeout_ms,
            "ROSTER_CAPTURE_TIMEOUT_MS",
            env("ROSTER_CAPTURE_TIMEOUT_MS"),
        );
        set_parsed(
            &mut self.attendance.late_hour,
            "ROSTER_LATE_THRESHOLD_HOUR",
            env("ROSTER_LATE_THRESHOLD_HOUR"),
        );
        set_parsed(
            &mut self.attendance.late_minute,
            "ROSTER_LATE_THRESHOLD_MINUTE",
            env("ROSTER_LATE_THRESHOLD_MINUTE"),
        );
        set_bool(
            &mut self.attendance.allow_multiple_checkin,
            "ROSTER_ALLOW_MULTIPLE_CHECKIN",
            env("ROSTER_ALLOW_MULTIPLE_CHECKIN"),
        );
        set_bool(&mut self.audio.enable_audio, "ROSTER_ENABLE_AUDIO", env("ROSTER_ENABLE_AUDIO"));
        set_parsed(&mut self.audio.speech_rate, "ROSTER_SPEECH_RATE", env("ROSTER_SPEECH_RATE"));
        set_parsed(
            &mut self.audio.speech_idle_secs,
            "ROSTER_SPEECH_IDLE_SECS",
            env("ROSTER_SPEECH_IDLE_SECS"),
        );
        set_parsed(&mut self.kiosk_interval_ms, "ROSTER_KIOSK_INTERVAL_MS", env("ROSTER_KIOSK_INTERVAL_MS"));
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f32| -> Result<()> {
            if !(value > 0.0 && value <= 1.0) {
                bail!("{name} must be in (0, 1], got {value}");
            }
            Ok(())
        };
        unit("face tolerance", self.matching.tolerance)?;
        unit("pixel threshold", self.matching.fused_threshold)?;

        if self.attendance.late_hour > 23 || self.attendance.late_minute > 59 {
            bail!(
                "late threshold {}:{:02} is not a valid clock time",
                self.attendance.late_hour,
                self.attendance.late_minute
            );
        }
        if self.camera.capture_timeout_ms == 0 {
            bail!("capture timeout must be greater than zero");
        }
        Ok(())
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            gallery_dir: self.gallery_dir.clone(),
            models: ModelPaths::in_dir(&self.model_dir),
            strategy: self.strategy,
            gallery: self.gallery.clone(),
            matching: self.matching.clone(),
            pixel: self.pixel.clone(),
            attendance: self.attendance.clone(),
        }
    }

    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            device: self.camera.device.clone(),
            width: self.camera.width,
            height: self.camera.height,
            warmup_frames: self.camera.warmup_frames,
            timeout: Duration::from_millis(self.camera.capture_timeout_ms),
        }
    }

    pub fn speech_settings(&self) -> SpeechSettings {
        SpeechSettings {
            program: self.audio.speech_program.clone(),
            rate: self.audio.speech_rate,
            idle_timeout: Duration::from_secs(self.audio.speech_idle_secs),
        }
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, key: &str, value: Option<String>) {
    let Some(raw) = value else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}

fn set_bool(slot: &mut bool, key: &str, value: Option<String>) {
    let Some(raw) = value else {
        return;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *slot = true,
        "0" | "false" | "no" | "off" => *slot = false,
        _ => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.matching.tolerance, 0.6);
        assert_eq!(config.gallery.min_face_size, 50);
        assert_eq!(config.attendance.late_hour, 10);
        assert!(config.audio.enable_audio);
        assert!(config.db_path.ends_with("roster/attendance.db"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
gallery_dir = "/srv/faces"
strategy = "pixel"

[matching]
tolerance = 0.45

[attendance]
late_hour = 9
late_minute = 30

[camera]
device = "/dev/video2"
"#,
        )
        .unwrap();

        assert_eq!(config.gallery_dir, PathBuf::from("/srv/faces"));
        assert_eq!(config.strategy, StrategyPreference::Pixel);
        assert_eq!(config.matching.tolerance, 0.45);
        assert_eq!(config.matching.fused_threshold, 0.6);
        assert_eq!(config.attendance.late_minute, 30);
        assert!(!config.attendance.allow_multiple_checkin);
        assert_eq!(config.camera.device, "/dev/video2");
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.pixel.size, 100);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(Config::from_toml("strategy = \"laser\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[
            ("ROSTER_GALLERY_DIR", "/tmp/gallery"),
            ("ROSTER_STRATEGY", "embedding"),
            ("ROSTER_FACE_TOLERANCE", "0.5"),
            ("ROSTER_PIXEL_THRESHOLD", "0.7"),
            ("ROSTER_MIN_FACE_SIZE", "80"),
            ("ROSTER_FACE_QUALITY_THRESHOLD", "45.5"),
            ("ROSTER_DUPLICATE_POLICY", "reject"),
            ("ROSTER_CAPTURE_TIMEOUT_MS", "500"),
            ("ROSTER_ALLOW_MULTIPLE_CHECKIN", "true"),
            ("ROSTER_ENABLE_AUDIO", "false"),
            ("ROSTER_SPEECH_RATE", "120"),
        ]));

        assert_eq!(config.gallery_dir, PathBuf::from("/tmp/gallery"));
        assert_eq!(config.strategy, StrategyPreference::Embedding);
        assert_eq!(config.matching.tolerance, 0.5);
        assert_eq!(config.matching.fused_threshold, 0.7);
        assert_eq!(config.gallery.min_face_size, 80);
        assert_eq!(config.gallery.quality.min_blur_variance, 45.5);
        assert_eq!(config.gallery.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(config.camera_settings().timeout, Duration::from_millis(500));
        assert!(config.attendance.allow_multiple_checkin);
        assert!(!config.audio.enable_audio);
        assert_eq!(config.speech_settings().rate, 120);
    }

    #[test]
    fn test_bad_override_keeps_value() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[
            ("ROSTER_FACE_TOLERANCE", "lots"),
            ("ROSTER_ENABLE_AUDIO", "maybe"),
            ("ROSTER_MIN_FACE_SIZE", ""),
        ]));
        assert_eq!(config.matching.tolerance, 0.6);
        assert!(config.audio.enable_audio);
        assert_eq!(config.gallery.min_face_size, 50);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = Config::default();
        config.matching.tolerance = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.matching.fused_threshold = 1.2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.attendance.late_hour = 24;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.attendance.late_minute = 60;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.camera.capture_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_service_config_uses_model_dir() {
        let mut config = Config::default();
        config.model_dir = PathBuf::from("/opt/models");
        let service = config.service_config();
        assert_eq!(service.models, ModelPaths::in_dir(Path::new("/opt/models")));
        assert_eq!(service.gallery_dir, config.gallery_dir);
    }
}
