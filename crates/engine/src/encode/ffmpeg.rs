//! ffmpeg invocation for outbound RTMP streams.
//!
//! Builds the argument list from a prepared source and resolved settings,
//! spawns the process with its progress channel wired up, and provides
//! graceful termination. The encoder is a black box: the engine reads its
//! progress and stderr text but never touches encoded bytes.

use crate::params::ResolvedSettings;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Lines of stderr kept for failure classification.
const STDERR_TAIL_LINES: usize = 40;

/// Buffered progress events between the reader task and the supervisor.
const PROGRESS_CHANNEL_CAPACITY: usize = 32;

/// Sample rate for both real and synthesized audio.
const AUDIO_SAMPLE_RATE: &str = "44100";

/// Error type for encoder process operations.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder process failed to start.
    #[error("failed to spawn encoder: {0}")]
    Spawn(std::io::Error),

    /// A stdio pipe was not available after spawn.
    #[error("encoder {0} pipe unavailable")]
    MissingPipe(&'static str),
}

/// The encoder-facing input location for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSpec {
    /// A single media file.
    File(PathBuf),
    /// An ffconcat manifest describing a virtual continuous input.
    Manifest(PathBuf),
}

/// Everything needed to build one encoder invocation.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub input: InputSpec,
    /// The source has no audio track; synthesize silent audio and map it
    /// against the video stream so the outbound stream always carries one.
    pub needs_silent_audio: bool,
    pub settings: ResolvedSettings,
    pub preset: String,
    pub audio_bitrate_kbps: u32,
    /// Full ingest URL including the stream key.
    pub destination: String,
    /// Instructs the encoder to self-terminate after this many seconds;
    /// treated as a graceful completed end, not a failure.
    pub duration_limit_secs: Option<u32>,
}

/// Joins a destination URL and stream key into the full ingest URL,
/// normalizing the scheme and trailing slashes.
pub fn ingest_url(destination_url: &str, stream_key: &str) -> String {
    let mut url = destination_url.trim().to_string();

    while url.ends_with('/') {
        url.pop();
    }

    if !url.starts_with("rtmp://") && !url.starts_with("rtmps://") {
        if url.contains(":443") {
            url = format!("rtmps://{}", url);
        } else {
            url = format!("rtmp://{}", url);
        }
    }

    format!("{}/{}", url, stream_key)
}

/// Builds the ffmpeg command for one broadcast attempt.
///
/// The input is read at realtime pace (`-re`) so the ingest endpoint sees a
/// live stream, and `-progress pipe:1` emits machine-readable progress on
/// stdout while stderr stays reserved for errors.
pub fn build_stream_command(ffmpeg_path: &str, params: &StreamParams) -> Command {
    let mut cmd = Command::new(ffmpeg_path);
    let settings = &params.settings;

    cmd.arg("-hide_banner");
    cmd.arg("-loglevel").arg("error");
    cmd.arg("-re");

    match &params.input {
        InputSpec::File(path) => {
            cmd.arg("-i").arg(path);
        }
        InputSpec::Manifest(path) => {
            // Concat demuxer; -safe 0 permits the absolute paths the
            // resolver produces.
            cmd.arg("-f").arg("concat");
            cmd.arg("-safe").arg("0");
            cmd.arg("-i").arg(path);
        }
    }

    if params.needs_silent_audio {
        cmd.arg("-f").arg("lavfi");
        cmd.arg("-i").arg(format!(
            "anullsrc=channel_layout=stereo:sample_rate={}",
            AUDIO_SAMPLE_RATE
        ));
        // The silent source is unbounded; -shortest ends the stream when
        // the video input does.
        cmd.arg("-map").arg("0:v:0");
        cmd.arg("-map").arg("1:a:0");
        cmd.arg("-shortest");
    }

    cmd.arg("-c:v").arg("libx264");
    cmd.arg("-preset").arg(&params.preset);
    cmd.arg("-b:v").arg(format!("{}k", settings.bitrate_kbps));
    cmd.arg("-maxrate").arg(format!("{}k", settings.maxrate_kbps));
    cmd.arg("-bufsize").arg(format!("{}k", settings.bufsize_kbps));
    cmd.arg("-vf")
        .arg(format!("scale={}:{}", settings.width, settings.height));
    cmd.arg("-r").arg(settings.frame_rate.to_string());
    // Keyframe every two seconds, a common ingest requirement.
    cmd.arg("-g").arg((settings.frame_rate * 2).to_string());
    cmd.arg("-pix_fmt").arg("yuv420p");

    cmd.arg("-c:a").arg("aac");
    cmd.arg("-b:a").arg(format!("{}k", params.audio_bitrate_kbps));
    cmd.arg("-ar").arg(AUDIO_SAMPLE_RATE);

    if let Some(limit) = params.duration_limit_secs {
        cmd.arg("-t").arg(limit.to_string());
    }

    cmd.arg("-progress").arg("pipe:1");
    cmd.arg("-nostats");

    cmd.arg("-f").arg("flv");
    cmd.arg(&params.destination);

    cmd
}

/// One sampled progress report from the encoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// Stream time encoded so far.
    pub out_time: Duration,
    pub fps: f32,
    pub bitrate_kbps: f32,
    pub speed: f32,
}

/// Incremental parser for ffmpeg's `-progress` key=value output.
///
/// Fields accumulate until the `progress=` terminator line, which flushes
/// one `ProgressEvent`.
#[derive(Debug, Default)]
pub struct ProgressParser {
    out_time_us: Option<u64>,
    fps: Option<f32>,
    bitrate_kbps: Option<f32>,
    speed: Option<f32>,
}

impl ProgressParser {
    /// Feeds one line; returns a completed event on block terminators.
    pub fn push_line(&mut self, line: &str) -> Option<ProgressEvent> {
        let (key, value) = line.split_once('=')?;
        let value = value.trim();

        match key {
            // out_time_ms is historically microseconds too.
            "out_time_us" | "out_time_ms" => {
                self.out_time_us = value.parse::<u64>().ok();
            }
            "fps" => {
                self.fps = value.parse::<f32>().ok();
            }
            "bitrate" => {
                self.bitrate_kbps = value
                    .strip_suffix("kbits/s")
                    .unwrap_or(value)
                    .trim()
                    .parse::<f32>()
                    .ok();
            }
            "speed" => {
                self.speed = value.strip_suffix('x').unwrap_or(value).parse::<f32>().ok();
            }
            "progress" => {
                let event = ProgressEvent {
                    out_time: Duration::from_micros(self.out_time_us.unwrap_or(0)),
                    fps: self.fps.unwrap_or(0.0),
                    bitrate_kbps: self.bitrate_kbps.unwrap_or(0.0),
                    speed: self.speed.unwrap_or(0.0),
                };
                return Some(event);
            }
            _ => {}
        }

        None
    }
}

/// How a finished encoder process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Last stderr lines, for classification and diagnostics.
    pub stderr_tail: String,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Short human description of the termination.
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("signal {}", signal),
            (None, None) => "unknown termination".to_string(),
        }
    }
}

/// A running encoder process with its progress channel.
#[derive(Debug)]
pub struct StreamProcess {
    pub child: Child,
    /// Parsed progress events; closes when the encoder's stdout does.
    pub progress: mpsc::Receiver<ProgressEvent>,
    stderr_task: JoinHandle<String>,
}

/// Spawns the encoder for one attempt and wires up its pipes.
pub fn spawn_stream(ffmpeg_path: &str, params: &StreamParams) -> Result<StreamProcess, EncodeError> {
    let mut cmd = build_stream_command(ffmpeg_path, params);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(EncodeError::Spawn)?;

    let stdout = child
        .stdout
        .take()
        .ok_or(EncodeError::MissingPipe("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(EncodeError::MissingPipe("stderr"))?;

    let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
    tokio::spawn(read_progress(stdout, progress_tx));
    let stderr_task = tokio::spawn(read_stderr_tail(stderr));

    Ok(StreamProcess {
        child,
        progress: progress_rx,
        stderr_task,
    })
}

impl StreamProcess {
    /// Graceful stop: SIGTERM, a grace period, then force-kill.
    pub async fn terminate(&mut self, grace: Duration) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                return;
            }
            debug!(pid, "encoder ignored SIGTERM, force-killing");
        }

        let _ = self.child.kill().await;
    }

    /// Collects the terminal exit descriptor once the child has exited.
    pub async fn collect_exit(self, status: std::process::ExitStatus) -> ProcessExit {
        let stderr_tail = self.stderr_task.await.unwrap_or_default();
        ProcessExit {
            code: status.code(),
            signal: exit_signal(&status),
            stderr_tail,
        }
    }
}

fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

async fn read_progress(stdout: ChildStdout, tx: mpsc::Sender<ProgressEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut parser = ProgressParser::default();

    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(event) = parser.push_line(line.trim()) {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    }
}

async fn read_stderr_tail(stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    tail.into_iter().collect::<Vec<_>>().join("\n")
}
