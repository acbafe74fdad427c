use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,

    /// Capture formats tried in order when opening or reopening the device
    #[serde(default = "default_backends")]
    pub backends: Vec<String>,

    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,

    /// Consecutive failed reads before the device is reopened
    #[serde(default = "default_read_failure_threshold")]
    pub read_failure_threshold: u32,

    #[serde(default = "default_max_reopen_attempts")]
    pub max_reopen_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_reopen_delay_ms")]
    pub reopen_delay_ms: u64,

    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Flip frames horizontally so the preview behaves like a mirror
    #[serde(default = "default_true")]
    pub mirror: bool,
}

fn default_backends() -> Vec<String> {
    vec!["MJPG".to_string(), "YUYV".to_string()]
}

fn default_warmup_frames() -> u32 {
    3
}

fn default_read_failure_threshold() -> u32 {
    10
}

fn default_max_reopen_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_reopen_delay_ms() -> u64 {
    1000
}

fn default_join_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl CameraConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reopen_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_delay_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    #[serde(default = "default_min_face_size")]
    pub min_face_size: u32,
}

fn default_min_face_size() -> u32 {
    80
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Continuous detection time before login may complete
    pub required_dwell_secs: f64,
    /// Quality a tick must exceed (strictly) to complete login
    pub completion_quality: f32,
    /// How long a face may go missing before the session drops back to idle
    pub face_lost_grace_secs: f64,
    /// How long the terminal state is held before the runner returns
    pub success_hold_secs: f64,
    pub stability_threshold_px: f32,
    pub required_stable_frames: u32,
    pub instability_penalty: u32,
    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            required_dwell_secs: 5.0,
            completion_quality: 0.2,
            face_lost_grace_secs: 1.0,
            success_hold_secs: 3.0,
            stability_threshold_px: 50.0,
            required_stable_frames: 10,
            instability_penalty: 2,
            poll_interval_ms: 10,
        }
    }
}

impl SessionConfig {
    pub fn required_dwell(&self) -> Duration {
        Duration::from_secs_f64(self.required_dwell_secs)
    }

    pub fn face_lost_grace(&self) -> Duration {
        Duration::from_secs_f64(self.face_lost_grace_secs)
    }

    pub fn success_hold(&self) -> Duration {
        Duration::from_secs_f64(self.success_hold_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Quality a raw observation must exceed to become a training sample
    pub acceptance_quality: f32,
    /// Raw observations kept per session
    pub max_observations: usize,
    /// Samples needed before opportunistic training starts
    pub min_samples: usize,
    /// Opportunistic training runs on every Nth eligible tick
    pub training_interval_ticks: u64,
    /// Sample count the set is padded to when login completes
    pub forced_sample_count: usize,
    /// Side length of the square grayscale training patch
    pub patch_size: u32,
    pub subject_label: i32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            acceptance_quality: 0.15,
            max_observations: 20,
            min_samples: 3,
            training_interval_ticks: 10,
            forced_sample_count: 5,
            patch_size: 200,
            subject_label: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub images_dir: PathBuf,
    pub records_dir: PathBuf,
    pub models_dir: PathBuf,
}

impl Config {
    /// Load configuration with fallback chain:
    /// 1. /etc/facegate/facegate.toml (system-wide)
    /// 2. ~/.config/facegate/facegate.toml (user)
    /// 3. Compiled defaults
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(config) = Self::load_from_path("/etc/facegate/facegate.toml") {
            config.validate()?;
            return Ok(config);
        }

        if let Some(home) = std::env::var_os("HOME") {
            let user_config = PathBuf::from(home)
                .join(".config")
                .join("facegate")
                .join("facegate.toml");
            if let Ok(config) = Self::load_from_path(&user_config) {
                config.validate()?;
                return Ok(config);
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from an explicit path, without fallback
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_path(path)?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Validation(
                "Camera dimensions must be non-zero".to_string(),
            ));
        }

        if self.camera.backends.is_empty() {
            return Err(ConfigError::Validation(
                "At least one camera backend must be configured".to_string(),
            ));
        }

        if let Some(bad) = self.camera.backends.iter().find(|b| b.len() != 4) {
            return Err(ConfigError::Validation(format!(
                "Camera backend {:?} is not a four-character code",
                bad
            )));
        }

        if self.camera.read_failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "Read failure threshold must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigError::Validation(
                "Detection confidence threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !is_non_negative(self.session.required_dwell_secs) {
            return Err(ConfigError::Validation(
                "Required dwell time must not be negative".to_string(),
            ));
        }

        if !is_non_negative(self.session.face_lost_grace_secs)
            || !is_non_negative(self.session.success_hold_secs)
        {
            return Err(ConfigError::Validation(
                "Grace and hold durations must not be negative".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.session.completion_quality) {
            return Err(ConfigError::Validation(
                "Completion quality must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.session.required_stable_frames == 0 {
            return Err(ConfigError::Validation(
                "Required stable frames must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.training.acceptance_quality) {
            return Err(ConfigError::Validation(
                "Acceptance quality must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.training.training_interval_ticks == 0 {
            return Err(ConfigError::Validation(
                "Training interval must be greater than 0".to_string(),
            ));
        }

        if self.training.forced_sample_count == 0 || self.training.max_observations == 0 {
            return Err(ConfigError::Validation(
                "Forced sample count and observation cap must be greater than 0".to_string(),
            ));
        }

        if self.training.patch_size < 16 {
            return Err(ConfigError::Validation(
                "Training patch size must be at least 16 pixels".to_string(),
            ));
        }

        for (name, dir) in [
            ("images", &self.storage.images_dir),
            ("records", &self.storage.records_dir),
            ("models", &self.storage.models_dir),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Storage {} directory cannot be empty",
                    name
                )));
            }
        }

        Ok(())
    }
}

fn is_non_negative(secs: f64) -> bool {
    secs.is_finite() && secs >= 0.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                device: "/dev/video0".to_string(),
                width: 1280,
                height: 720,
                backends: default_backends(),
                warmup_frames: default_warmup_frames(),
                read_failure_threshold: default_read_failure_threshold(),
                max_reopen_attempts: default_max_reopen_attempts(),
                retry_delay_ms: default_retry_delay_ms(),
                reopen_delay_ms: default_reopen_delay_ms(),
                join_timeout_ms: default_join_timeout_ms(),
                mirror: true,
            },
            detection: DetectionConfig {
                model_path: PathBuf::from("models/scrfd_500m.onnx"),
                confidence_threshold: 0.5,
                min_face_size: default_min_face_size(),
            },
            session: SessionConfig::default(),
            training: TrainingConfig::default(),
            storage: StorageConfig {
                images_dir: PathBuf::from("face_images"),
                records_dir: PathBuf::from("user_face_data"),
                models_dir: PathBuf::from("trained_models"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.required_dwell(), Duration::from_secs(5));
        assert_eq!(config.camera.read_failure_threshold, 10);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            [camera]
            device = "/dev/video2"
            width = 640
            height = 480

            [detection]
            model_path = "models/det.onnx"
            confidence_threshold = 0.6

            [session]
            required_dwell_secs = 3.0

            [storage]
            images_dir = "img"
            records_dir = "rec"
            models_dir = "mod"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.camera.backends, vec!["MJPG", "YUYV"]);
        assert_eq!(config.session.required_dwell_secs, 3.0);
        assert_eq!(config.session.completion_quality, 0.2);
        assert_eq!(config.training.forced_sample_count, 5);
        assert_eq!(config.detection.min_face_size, 80);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.session.completion_quality = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::default();
        config.camera.backends = vec!["MJPEG".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.training_interval_ticks = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.models_dir = PathBuf::new();
        assert!(config.validate().is_err());
    }
}
