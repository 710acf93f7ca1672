use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Loaded from an optional TOML file named by `ROLLCALL_CONFIG`, then
/// overridden field by field from `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base URL of the attendance backend.
    pub backend_url: String,
    /// Room this terminal watches. Unset means all rooms for the roster.
    pub room_id: Option<String>,
    /// V4L2 device path.
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub embedder_model: String,
    /// Embedding dimension produced by the embedder and stored in the roster.
    pub embedding_dim: usize,
    /// Cosine similarity needed for a qualifying match.
    pub similarity_threshold: f32,
    /// Detector confidence a face must exceed.
    pub detection_threshold: f32,
    /// Minimum face box side in pixels.
    pub min_face_size: u32,
    /// Pixels of context added around each face before embedding.
    pub crop_margin: u32,
    /// Gap without a sighting after which a presence is closed.
    pub presence_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// Heartbeat cadence for open sessions; must be shorter than the timeout.
    pub heartbeat_interval_ms: u64,
    pub roster_refresh_secs: u64,
    /// Pause between frames in the capture loop.
    pub frame_interval_ms: u64,
    pub http_timeout_secs: u64,
    /// Attempts per backend call, including the first.
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Upper bound on waiting for loops and the sync queue at shutdown.
    pub shutdown_grace_secs: u64,
    /// Serve D-Bus on the session bus instead of the system bus.
    pub dbus_session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8088".to_string(),
            room_id: None,
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            model_dir: PathBuf::from("/usr/share/rollcall/models"),
            detector_model: "res10_300x300_ssd.onnx".to_string(),
            embedder_model: "arcfaceresnet100-insightface.onnx".to_string(),
            embedding_dim: 512,
            similarity_threshold: 0.5,
            detection_threshold: 0.6,
            min_face_size: 80,
            crop_margin: 10,
            presence_timeout_ms: 10_000,
            sweep_interval_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            roster_refresh_secs: 30,
            frame_interval_ms: 33,
            http_timeout_secs: 10,
            retry_max_attempts: 3,
            retry_base_delay_ms: 250,
            shutdown_grace_secs: 5,
            dbus_session_bus: false,
        }
    }
}

impl Config {
    /// Load the file named by `ROLLCALL_CONFIG` (if any), apply environment
    /// overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `ROLLCALL_*` variables as resolved by `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Overrides { lookup };

        env.set(&mut self.backend_url, "ROLLCALL_BACKEND_URL");
        if let Some(room) = lookup_nonempty(&env.lookup, "ROLLCALL_ROOM_ID") {
            self.room_id = Some(room);
        }
        env.set(&mut self.camera_device, "ROLLCALL_CAMERA_DEVICE");
        env.set(&mut self.frame_width, "ROLLCALL_FRAME_WIDTH");
        env.set(&mut self.frame_height, "ROLLCALL_FRAME_HEIGHT");
        env.set(&mut self.model_dir, "ROLLCALL_MODEL_DIR");
        env.set(&mut self.detector_model, "ROLLCALL_DETECTOR_MODEL");
        env.set(&mut self.embedder_model, "ROLLCALL_EMBEDDER_MODEL");
        env.set(&mut self.embedding_dim, "ROLLCALL_EMBEDDING_DIM");
        env.set(&mut self.similarity_threshold, "ROLLCALL_SIMILARITY_THRESHOLD");
        env.set(&mut self.detection_threshold, "ROLLCALL_DETECTION_THRESHOLD");
        env.set(&mut self.min_face_size, "ROLLCALL_MIN_FACE_SIZE");
        env.set(&mut self.crop_margin, "ROLLCALL_CROP_MARGIN");
        env.set(&mut self.presence_timeout_ms, "ROLLCALL_PRESENCE_TIMEOUT_MS");
        env.set(&mut self.sweep_interval_ms, "ROLLCALL_SWEEP_INTERVAL_MS");
        env.set(&mut self.heartbeat_interval_ms, "ROLLCALL_HEARTBEAT_INTERVAL_MS");
        env.set(&mut self.roster_refresh_secs, "ROLLCALL_ROSTER_REFRESH_SECS");
        env.set(&mut self.frame_interval_ms, "ROLLCALL_FRAME_INTERVAL_MS");
        env.set(&mut self.http_timeout_secs, "ROLLCALL_HTTP_TIMEOUT_SECS");
        env.set(&mut self.retry_max_attempts, "ROLLCALL_RETRY_MAX_ATTEMPTS");
        env.set(&mut self.retry_base_delay_ms, "ROLLCALL_RETRY_BASE_DELAY_MS");
        env.set(&mut self.shutdown_grace_secs, "ROLLCALL_SHUTDOWN_GRACE_SECS");
        if let Some(v) = (env.lookup)("ROLLCALL_DBUS_SESSION") {
            self.dbus_session_bus = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.backend_url.trim().is_empty() {
            return invalid("backend_url is empty".into());
        }
        if self.embedding_dim == 0 {
            return invalid("embedding_dim must be > 0".into());
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return invalid(format!(
                "similarity_threshold {} outside [-1, 1]",
                self.similarity_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.detection_threshold) {
            return invalid(format!(
                "detection_threshold {} outside [0, 1]",
                self.detection_threshold
            ));
        }
        for (name, value) in [
            ("presence_timeout_ms", self.presence_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("roster_refresh_secs", self.roster_refresh_secs),
            ("http_timeout_secs", self.http_timeout_secs),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be > 0"));
            }
        }
        if self.retry_max_attempts == 0 {
            return invalid("retry_max_attempts must be >= 1".into());
        }
        if self.heartbeat_interval_ms >= self.presence_timeout_ms {
            return invalid(format!(
                "heartbeat_interval_ms ({}) must be shorter than presence_timeout_ms ({})",
                self.heartbeat_interval_ms, self.presence_timeout_ms
            ));
        }
        if i64::try_from(self.presence_timeout_ms).is_err() {
            return invalid("presence_timeout_ms is too large".into());
        }
        Ok(())
    }

    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join(&self.embedder_model)
            .to_string_lossy()
            .into_owned()
    }

    /// Room filter for roster refreshes; `None` means all rooms.
    pub fn room_filter(&self) -> Option<&str> {
        self.room_id.as_deref().filter(|r| !r.is_empty())
    }

    pub fn presence_timeout_ms(&self) -> i64 {
        self.presence_timeout_ms as i64
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn roster_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.roster_refresh_secs)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

struct Overrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<F> {
    fn set<T: FromStr>(&self, field: &mut T, key: &str) {
        let Some(raw) = (self.lookup)(key) else {
            return;
        };
        match raw.trim().parse() {
            Ok(value) => *field = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable config override"),
        }
    }
}

fn lookup_nonempty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}
