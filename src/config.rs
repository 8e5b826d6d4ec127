//! Tracker configuration.
//!
//! Every field has a default so an empty file (or no file at all) gives a
//! working tracker that sends `OnFaceMove` to `FaceReceiver`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::CameraSource;
use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "face-offset.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub camera: CameraConfig,
    pub detector: DetectorConfig,
    pub signal: SignalConfig,
    pub delivery: DeliveryConfig,
}

impl TrackerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load `path` if given, else `face-offset.toml` if present, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            tracing::info!("Loading config from {}", path.display());
            return Self::from_file(path);
        }
        let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
        if fallback.exists() {
            tracing::info!("Loading config from {}", fallback.display());
            return Self::from_file(fallback);
        }
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.width <= 0 || self.camera.height <= 0 {
            return Err(invalid(
                "camera.width/height",
                "Requested resolution must be positive",
            ));
        }
        if self.detector.max_frame_size == 0 {
            return Err(invalid(
                "detector.max_frame_size",
                "Working frame size must be greater than 0",
            ));
        }
        if !self.signal.sensitivity.is_finite() {
            return Err(invalid("signal.sensitivity", "Sensitivity must be finite"));
        }
        if self.signal.dead_zone.is_nan() || self.signal.dead_zone < 0.0 {
            return Err(invalid(
                "signal.dead_zone",
                "Dead zone must be zero or positive",
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(invalid(
                "delivery.max_attempts",
                "At least one delivery attempt is required",
            ));
        }
        if self.delivery.receiver.is_empty() || self.delivery.method.is_empty() {
            return Err(invalid(
                "delivery.receiver/method",
                "Receiver and method names must not be empty",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device index or stream url
    pub source: CameraSource,
    /// Requested capture width in pixels
    pub width: i32,
    /// Requested capture height in pixels
    pub height: i32,
    /// Flip frames horizontally, for front-facing cameras
    pub mirror: bool,
    /// How long to wait for the first frame after opening
    pub ready_timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: CameraSource::Device(0),
            width: 640,
            height: 480,
            mirror: true,
            ready_timeout_ms: 5000,
        }
    }
}

impl CameraConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Haar cascade, resolved through the OpenCV search path
    pub cascade: String,
    /// Long edge of the working frame
    pub max_frame_size: u32,
    pub redetect_interval_ms: u64,
    /// Fewer surviving tracked points than this forces a redetection
    pub min_tracked_points: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cascade: "haarcascades/haarcascade_frontalface_alt.xml".to_string(),
            max_frame_size: 320,
            redetect_interval_ms: 500,
            min_tracked_points: 8,
        }
    }
}

impl DetectorConfig {
    pub fn redetect_interval(&self) -> Duration {
        Duration::from_millis(self.redetect_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub sensitivity: f64,
    pub dead_zone: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            sensitivity: 1.5,
            dead_zone: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub receiver: String,
    pub method: String,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Zenoh key prefix
    pub key_prefix: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            receiver: "FaceReceiver".to_string(),
            method: "OnFaceMove".to_string(),
            max_attempts: 30,
            retry_delay_ms: 200,
            key_prefix: "face-tracker".to_string(),
        }
    }
}

impl DeliveryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = TrackerConfig::from_toml("").unwrap();
        assert_eq!(config, TrackerConfig::default());
        assert_eq!(config.delivery.receiver, "FaceReceiver");
        assert_eq!(config.delivery.method, "OnFaceMove");
        assert_eq!(config.signal.sensitivity, 1.5);
        assert_eq!(config.detector.max_frame_size, 320);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = TrackerConfig::from_toml(
            r#"
            [camera]
            source = "rtsps://cam.local/stream"
            mirror = false

            [signal]
            sensitivity = 2.0

            [delivery]
            receiver = "Player"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.camera.source,
            CameraSource::Url("rtsps://cam.local/stream".to_string())
        );
        assert!(!config.camera.mirror);
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.signal.sensitivity, 2.0);
        assert_eq!(config.signal.dead_zone, 0.01);
        assert_eq!(config.delivery.receiver, "Player");
        assert_eq!(config.delivery.method, "OnFaceMove");
    }

    #[test]
    fn device_index_parses_as_device() {
        let config = TrackerConfig::from_toml("[camera]\nsource = 2\n").unwrap();
        assert_eq!(config.camera.source, CameraSource::Device(2));
    }

    #[test]
    fn validation_rejects_zero_attempts() {
        let mut config = TrackerConfig::default();
        config.delivery.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn validation_rejects_negative_dead_zone() {
        let mut config = TrackerConfig::default();
        config.signal.dead_zone = -0.5;
        assert!(config.validate().is_err());
        config.signal.dead_zone = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(
            TrackerConfig::from_toml("[signal\nsensitivity = "),
            Err(ConfigError::Parse(_))
        ));
    }
}
