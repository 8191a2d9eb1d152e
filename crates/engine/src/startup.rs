//! Startup checks for the Livecast daemon.
//!
//! Preflight checks verifying the external tools the engine supervises are
//! actually present before the daemon starts accepting broadcasts:
//! - ffmpeg availability and minimum version
//! - ffprobe availability

use livecast_config::Config;
use std::process::Command;
use thiserror::Error;

/// Minimum ffmpeg major version with the concat demuxer, lavfi and
/// progress-reporting behavior the engine relies on.
const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg not usable: {0}")]
    FfmpegUnavailable(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    // Look for "ffmpeg version" followed by the version string
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    // Extract the version part after "ffmpeg version"
    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .trim()
        .split_whitespace()
        .next()?
        .to_string();

    // Handle n-prefixed versions (e.g., "n6.1-...")
    let version_str = version_part.trim_start_matches('n');

    // Extract major version (before first '.' or '-')
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Check that the configured ffmpeg runs and meets the minimum version
pub fn check_ffmpeg_available(ffmpeg_path: &str) -> Result<(), StartupError> {
    let output = Command::new(ffmpeg_path)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfmpegUnavailable(format!(
                "{} -version failed; is FFmpeg installed and in PATH? Error: {}",
                ffmpeg_path, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "{} -version failed",
            ffmpeg_path
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major_version = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegUnavailable(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major_version < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegUnavailable(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major_version
        )));
    }

    Ok(())
}

/// Check that the configured ffprobe runs
pub fn check_ffprobe_available(ffprobe_path: &str) -> Result<(), StartupError> {
    let output = Command::new(ffprobe_path)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfprobeUnavailable(format!(
                "{} -version failed; is ffprobe installed and in PATH? Error: {}",
                ffprobe_path, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfprobeUnavailable(format!(
            "{} -version failed",
            ffprobe_path
        )));
    }

    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. ffmpeg availability and version
/// 2. ffprobe availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_ffmpeg_available(&cfg.encoder.ffmpeg_path)?;
    check_ffprobe_available(&cfg.encoder.ffprobe_path)?;
    Ok(())
}
