//! Source probing via ffprobe.
//!
//! Collects the stream and format metadata the engine needs before a
//! broadcast starts: native resolution, frame rate and bitrate for encode
//! parameter resolution, and audio-track presence for silent-audio synthesis.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Information about a video stream from ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    /// Codec name (e.g., "hevc", "h264", "av1").
    pub codec_name: String,
    /// Video width in pixels.
    pub width: u32,
    /// Video height in pixels.
    pub height: u32,
    /// Average frame rate (if available).
    pub frame_rate: Option<f32>,
    /// Bitrate in kbps (if available).
    pub bitrate_kbps: Option<f32>,
}

/// Information about an audio stream from ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    /// Codec name (e.g., "aac", "mp3", "opus").
    pub codec_name: String,
    /// Number of audio channels.
    pub channels: u32,
}

/// Format information from ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatInfo {
    /// Duration in seconds.
    pub duration_secs: f64,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// Result of probing a video file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    /// Video streams found in the file.
    pub video_streams: Vec<VideoStream>,
    /// Audio streams found in the file.
    pub audio_streams: Vec<AudioStream>,
    /// Format information.
    pub format: FormatInfo,
}

impl ProbeResult {
    /// Whether the file carries at least one audio track.
    pub fn has_audio(&self) -> bool {
        !self.audio_streams.is_empty()
    }

    /// The first video stream, if any.
    pub fn primary_video(&self) -> Option<&VideoStream> {
        self.video_streams.first()
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub avg_frame_rate: Option<String>,
        pub bit_rate: Option<String>,
        pub channels: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Probes a video file using ffprobe to collect stream and format metadata.
///
/// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`
/// and parses the JSON output.
pub async fn probe_file(ffprobe_path: &str, path: &Path) -> Result<ProbeResult, ProbeError> {
    let output = Command::new(ffprobe_path)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

/// Parses ffprobe JSON output into a ProbeResult.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let mut video_streams = Vec::new();
    let mut audio_streams = Vec::new();

    for stream in streams {
        let codec_type = stream.codec_type.as_deref().unwrap_or("");
        let codec_name = stream.codec_name.clone().unwrap_or_default();

        match codec_type {
            "video" => {
                let bitrate_kbps = stream
                    .bit_rate
                    .as_ref()
                    .and_then(|br| br.parse::<f64>().ok())
                    .map(|bps| (bps / 1000.0) as f32);

                let frame_rate = stream.avg_frame_rate.as_deref().and_then(parse_frame_rate);

                video_streams.push(VideoStream {
                    codec_name,
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    frame_rate,
                    bitrate_kbps,
                });
            }
            "audio" => {
                audio_streams.push(AudioStream {
                    codec_name,
                    channels: stream.channels.unwrap_or(0),
                });
            }
            _ => {}
        }
    }

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(ProbeResult {
        video_streams,
        audio_streams,
        format: FormatInfo {
            duration_secs,
            size_bytes,
        },
    })
}

/// Parses ffprobe's rational frame-rate notation ("30000/1001", "25/1").
///
/// Returns None for the "0/0" placeholder ffprobe emits on streams without
/// a meaningful rate.
fn parse_frame_rate(raw: &str) -> Option<f32> {
    let (num, den) = match raw.split_once('/') {
        Some((n, d)) => (n.parse::<f32>().ok()?, d.parse::<f32>().ok()?),
        None => (raw.parse::<f32>().ok()?, 1.0),
    };

    if den == 0.0 || num <= 0.0 {
        return None;
    }

    Some(num / den)
}
