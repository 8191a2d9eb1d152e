//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Media library layout: where stored assets live and where per-attempt
/// artifacts (playlist manifests) are written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    /// Directory holding converted assets (primary lookup path).
    #[serde(default = "default_library_dir")]
    pub library_dir: PathBuf,
    /// Directory holding original uploads (second lookup path).
    #[serde(default = "default_originals_dir")]
    pub originals_dir: PathBuf,
    /// Legacy library prefix checked as a last resort (None disables it).
    #[serde(default)]
    pub legacy_prefix: Option<PathBuf>,
    /// Scratch directory for playlist manifests.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_library_dir() -> PathBuf {
    PathBuf::from("/var/lib/livecast/media")
}

fn default_originals_dir() -> PathBuf {
    PathBuf::from("/var/lib/livecast/uploads")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/livecast")
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            library_dir: default_library_dir(),
            originals_dir: default_originals_dir(),
            legacy_prefix: None,
            work_dir: default_work_dir(),
        }
    }
}

/// Encoder invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Path to the ffmpeg binary.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Path to the ffprobe binary.
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Video bitrate used when neither the caller nor the source supplies one.
    #[serde(default = "default_bitrate_kbps")]
    pub default_bitrate_kbps: u32,
    /// Frame rate used when neither the caller nor the source supplies one.
    #[serde(default = "default_frame_rate")]
    pub default_frame_rate: u32,
    /// Audio bitrate for the outbound stream.
    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,
    /// x264 preset for the outbound stream.
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Seconds to wait after SIGTERM before force-killing the encoder.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_bitrate_kbps() -> u32 {
    2500
}

fn default_frame_rate() -> u32 {
    30
}

fn default_audio_bitrate_kbps() -> u32 {
    128
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_stop_grace_secs() -> u64 {
    5
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            default_bitrate_kbps: default_bitrate_kbps(),
            default_frame_rate: default_frame_rate(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            preset: default_preset(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

/// Reconnection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum reconnect attempts per broadcast before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    4
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// Stream health monitoring settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    /// Seconds without a progress event before a stream counts as stalled.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// Number of bitrate samples kept in the rolling quality window.
    #[serde(default = "default_bitrate_window")]
    pub bitrate_window: usize,
    /// Relative deviation (std dev / mean) above which bitrate is unstable.
    #[serde(default = "default_instability_ratio")]
    pub instability_ratio: f32,
    /// Seconds of stream time between forwarded bitrate samples.
    #[serde(default = "default_bitrate_sample_secs")]
    pub bitrate_sample_secs: u64,
}

fn default_stall_timeout_secs() -> u64 {
    30
}

fn default_bitrate_window() -> usize {
    60
}

fn default_instability_ratio() -> f32 {
    0.3
}

fn default_bitrate_sample_secs() -> u64 {
    10
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: default_stall_timeout_secs(),
            bitrate_window: default_bitrate_window(),
            instability_ratio: default_instability_ratio(),
            bitrate_sample_secs: default_bitrate_sample_secs(),
        }
    }
}

/// Playlist manifest settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistConfig {
    /// How many times a looping playlist is repeated in the manifest.
    #[serde(default = "default_loop_repeats")]
    pub loop_repeats: u32,
}

fn default_loop_repeats() -> u32 {
    500
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            loop_repeats: default_loop_repeats(),
        }
    }
}

/// Status/control HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Port the status server binds on 127.0.0.1.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_port() -> u16 {
    7878
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub playlist: PlaylistConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - LIVECAST_FFMPEG_PATH -> encoder.ffmpeg_path
    /// - LIVECAST_FFPROBE_PATH -> encoder.ffprobe_path
    /// - LIVECAST_WORK_DIR -> media.work_dir
    /// - LIVECAST_MAX_ATTEMPTS -> retry.max_attempts
    /// - LIVECAST_LISTEN_PORT -> server.listen_port
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("LIVECAST_FFMPEG_PATH") {
            if !val.is_empty() {
                self.encoder.ffmpeg_path = val;
            }
        }

        if let Ok(val) = env::var("LIVECAST_FFPROBE_PATH") {
            if !val.is_empty() {
                self.encoder.ffprobe_path = val;
            }
        }

        if let Ok(val) = env::var("LIVECAST_WORK_DIR") {
            if !val.is_empty() {
                self.media.work_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("LIVECAST_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse::<u32>() {
                self.retry.max_attempts = attempts;
            }
        }

        if let Ok(val) = env::var("LIVECAST_LISTEN_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.listen_port = port;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
