use crate::stream::{StreamError, StreamSettings};
use chrono::TimeDelta;
use facetrack_core::{TrackerConfig, DEFAULT_MIN_FACES};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound for `debounce_secs` and `absence_timeout_secs` (one week).
pub const MAX_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Built from defaults, then the TOML file named by `FACETRACK_CONFIG`
/// (default `$XDG_CONFIG_HOME/facetrack/facetrack.toml`, optional), then
/// `FACETRACK_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Camera identifier stamped on every attendance event.
    pub camera_id: String,
    /// Root for persistent data; employees live under `<data_dir>/employees`.
    pub data_dir: PathBuf,
    /// Face detector helper command line (program followed by arguments).
    pub detector_command: Vec<String>,
    /// Minimum cosine similarity for a positive match.
    pub recognition_threshold: f32,
    /// Minimum detector confidence for a face to be matched while streaming.
    pub detection_threshold: f32,
    /// Valid faces required to enroll a new employee.
    pub min_faces: usize,
    /// Suppress a check-in this soon after the same employee's check-out.
    pub debounce_secs: u64,
    /// Silence after which a present employee is checked out.
    pub absence_timeout_secs: u64,
    /// Capture rate limit in frames per second (0 = unlimited).
    pub fps_target: u32,
    /// Consecutive read/detection failures tolerated before degrading.
    pub max_retries: u32,
    /// How long `stop` waits for the stream threads.
    pub stop_grace_ms: u64,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
    /// Start the camera stream as soon as the daemon is up.
    pub autostart: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_id: "main".to_string(),
            data_dir: default_data_dir(),
            detector_command: Vec::new(),
            recognition_threshold: 0.40,
            detection_threshold: 0.60,
            min_faces: DEFAULT_MIN_FACES,
            debounce_secs: 60,
            absence_timeout_secs: 300,
            fps_target: 30,
            max_retries: 5,
            stop_grace_ms: 2000,
            system_bus: false,
            autostart: false,
        }
    }
}

impl Config {
    /// Load configuration from the config file and `FACETRACK_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let (path, explicit) = match std::env::var("FACETRACK_CONFIG") {
            Ok(p) => (PathBuf::from(p), true),
            Err(_) => (default_config_path(), false),
        };
        let mut config = if path.is_file() || explicit {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "configuration file loaded");
        Ok(config)
    }

    /// Overlay environment variables, looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("FACETRACK_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("FACETRACK_CAMERA_ID") {
            self.camera_id = v;
        }
        if let Some(v) = var("FACETRACK_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FACETRACK_DETECTOR_COMMAND") {
            self.detector_command = v.split_whitespace().map(str::to_string).collect();
        }
        env_parse(&var, "FACETRACK_RECOGNITION_THRESHOLD", &mut self.recognition_threshold);
        env_parse(&var, "FACETRACK_DETECTION_THRESHOLD", &mut self.detection_threshold);
        env_parse(&var, "FACETRACK_MIN_FACES", &mut self.min_faces);
        env_parse(&var, "FACETRACK_DEBOUNCE_SECS", &mut self.debounce_secs);
        env_parse(&var, "FACETRACK_ABSENCE_TIMEOUT_SECS", &mut self.absence_timeout_secs);
        env_parse(&var, "FACETRACK_FPS_TARGET", &mut self.fps_target);
        env_parse(&var, "FACETRACK_MAX_RETRIES", &mut self.max_retries);
        env_parse(&var, "FACETRACK_STOP_GRACE_MS", &mut self.stop_grace_ms);
        if let Some(v) = var("FACETRACK_SYSTEM_BUS") {
            self.system_bus = v != "0";
        }
        if let Some(v) = var("FACETRACK_AUTOSTART") {
            self.autostart = v != "0";
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stream_settings().validate().map_err(|e| match e {
            StreamError::InvalidSettings(msg) => ConfigError::Invalid(msg),
            other => ConfigError::Invalid(other.to_string()),
        })?;
        if self.min_faces == 0 {
            return Err(ConfigError::Invalid("min_faces must be at least 1".into()));
        }
        if self.absence_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "absence_timeout_secs must be positive".into(),
            ));
        }
        self.tracker_config()?;
        Ok(())
    }

    /// Embedding store root.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("employees")
    }

    pub fn tracker_config(&self) -> Result<TrackerConfig, ConfigError> {
        Ok(TrackerConfig {
            debounce: window("debounce_secs", self.debounce_secs)?,
            absence_timeout: window("absence_timeout_secs", self.absence_timeout_secs)?,
        })
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            camera_device: self.camera_device.clone(),
            camera_id: self.camera_id.clone(),
            recognition_threshold: self.recognition_threshold,
            detection_threshold: self.detection_threshold,
            fps_target: self.fps_target,
            max_retries: self.max_retries,
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            ..StreamSettings::default()
        }
    }
}

fn window(name: &str, secs: u64) -> Result<TimeDelta, ConfigError> {
    if secs > MAX_WINDOW_SECS {
        return Err(ConfigError::Invalid(format!(
            "{name} must be at most {MAX_WINDOW_SECS}, got {secs}"
        )));
    }
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| ConfigError::Invalid(format!("{name} is out of range: {secs}")))
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("facetrack")
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("facetrack/facetrack.toml")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn env_parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}
