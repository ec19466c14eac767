use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rollcall_core::{MarkingPolicy, SessionSettings};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    #[default]
    Session,
    System,
}

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Feed sessions blank frames instead of opening the camera.
    pub synthetic_frames: bool,
    /// Frame rate for synthetic frames.
    pub target_fps: u32,
    /// One folder per enrolled identity.
    pub dataset_dir: PathBuf,
    /// Student directory JSON keyed by student id.
    pub student_db: PathBuf,
    /// Append-only CSV attendance log.
    pub attendance_log: PathBuf,
    /// Recorded detections to replay instead of live recognition.
    pub replay_script: Option<PathBuf>,
    /// Recognize every Nth frame.
    pub sample_every: u32,
    /// Flush queued attendance every N sampling ticks.
    pub flush_every_ticks: u32,
    /// Distance below which a match is accepted.
    pub acceptance_bound: f32,
    pub cooldown_secs: u64,
    pub marking_policy: MarkingPolicy,
    pub bus: Bus,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            synthetic_frames: false,
            target_fps: 20,
            dataset_dir: data_dir.join("dataset"),
            student_db: data_dir.join("student_database.json"),
            attendance_log: data_dir.join("attendance.csv"),
            replay_script: None,
            sample_every: 2,
            flush_every_ticks: 10,
            acceptance_bound: 75.0,
            cooldown_secs: 5,
            marking_policy: MarkingPolicy::Session,
            bus: Bus::Session,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Some(read_file(Path::new(&path))?),
            Err(_) => None,
        };
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Build from TOML text and an environment lookup; the environment wins.
    pub fn from_sources<F>(file: Option<&str>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = match file {
            Some(raw) => toml::from_str(raw)?,
            None => Config::default(),
        };

        if let Some(v) = env("ROLLCALL_CAMERA_DEVICE") {
            config.camera_device = v;
        }
        if let Some(v) = env("ROLLCALL_DATASET_DIR") {
            config.dataset_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_STUDENT_DB") {
            config.student_db = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_ATTENDANCE_LOG") {
            config.attendance_log = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_REPLAY_SCRIPT") {
            config.replay_script = Some(PathBuf::from(v));
        }
        if let Some(v) = env("ROLLCALL_SYNTHETIC_FRAMES") {
            config.synthetic_frames = v != "0";
        }
        config.camera_width = env_or(&env, "ROLLCALL_CAMERA_WIDTH", config.camera_width);
        config.camera_height = env_or(&env, "ROLLCALL_CAMERA_HEIGHT", config.camera_height);
        config.target_fps = env_or(&env, "ROLLCALL_TARGET_FPS", config.target_fps);
        config.sample_every = env_or(&env, "ROLLCALL_SAMPLE_EVERY", config.sample_every);
        config.flush_every_ticks = env_or(&env, "ROLLCALL_FLUSH_EVERY_TICKS", config.flush_every_ticks);
        config.acceptance_bound = env_or(&env, "ROLLCALL_ACCEPTANCE_BOUND", config.acceptance_bound);
        config.cooldown_secs = env_or(&env, "ROLLCALL_COOLDOWN_SECS", config.cooldown_secs);
        if let Some(v) = env("ROLLCALL_MARKING_POLICY") {
            config.marking_policy = match v.to_ascii_lowercase().as_str() {
                "session" => MarkingPolicy::Session,
                "day" => MarkingPolicy::Day,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "ROLLCALL_MARKING_POLICY must be \"session\" or \"day\", got {other:?}"
                    )))
                }
            };
        }
        if let Some(v) = env("ROLLCALL_BUS") {
            config.bus = if v.eq_ignore_ascii_case("system") {
                Bus::System
            } else {
                Bus::Session
            };
        }

        config
            .session_settings()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if config.target_fps == 0 {
            return Err(ConfigError::Invalid("target_fps must be at least 1".into()));
        }
        Ok(config)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            sample_every: self.sample_every,
            flush_every_ticks: self.flush_every_ticks,
            acceptance_bound: self.acceptance_bound,
            cooldown: Duration::from_secs(self.cooldown_secs),
            marking_policy: self.marking_policy,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.target_fps.max(1)))
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse `key` if set and valid; otherwise keep `current`.
fn env_or<F, T>(env: &F, key: &str, current: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match env(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable setting");
                current
            }
        },
        None => current,
    }
}
