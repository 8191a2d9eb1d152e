//! Broadcast orchestration.
//!
//! `BroadcastEngine` is the boundary collaborators call: Start/Stop plus
//! read-only registry queries. Each started broadcast runs as its own
//! tokio task that prepares the source, spawns and supervises the encoder
//! process, classifies failures and drives reconnection. All persisted
//! status transitions flow through the injected `StatusStore`.

use crate::classify::{classify_failure, failure_message, FailureKind};
use crate::encode::{
    ingest_url, spawn_stream, EncodeError, InputSpec, ProcessExit, StreamParams,
};
use crate::health::{BitrateWindow, StallDetector};
use crate::params::{resolve_settings, EncodeDefaults, EncodeOverrides, ResolvedSettings};
use crate::quirks;
use crate::registry::{SessionInfo, SessionRegistry, SessionState};
use crate::retry::{RetryDecision, RetryState};
use crate::source::{prepare_source, PreparedSource, SourceError, SourceSpec, StreamInput};
use crate::status::{BroadcastStatus, StatusStore};
use livecast_config::Config;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Error type for Start calls. Returned synchronously; these never reach
/// the retry machinery.
#[derive(Debug, Error)]
pub enum StartError {
    /// A session for this broadcast already exists.
    #[error("broadcast {0} is already active")]
    AlreadyActive(String),

    /// Source preparation failed before anything was spawned.
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Error type for Stop calls.
#[derive(Debug, Error)]
pub enum StopError {
    /// No session exists for this broadcast.
    #[error("broadcast {0} is not active")]
    NotActive(String),
}

/// Everything a collaborator supplies to start a broadcast.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub broadcast_id: String,
    pub source: SourceSpec,
    pub destination_url: String,
    pub stream_key: String,
    /// When set, the encoder self-terminates after this many seconds and
    /// the broadcast completes gracefully.
    pub duration_limit_secs: Option<u32>,
    pub overrides: EncodeOverrides,
}

/// How one encoder attempt ended.
#[derive(Debug)]
enum AttemptOutcome {
    /// The encoder exited cleanly (source exhausted or duration limit hit).
    Completed,
    /// A stop request pre-empted the attempt.
    Cancelled,
    /// The encoder process could not be launched at all.
    SpawnFailed(EncodeError),
    /// The encoder died; `stalled` marks a termination we forced after
    /// progress stopped arriving.
    Failed { exit: ProcessExit, stalled: bool },
}

struct EngineInner {
    config: Config,
    registry: SessionRegistry,
    store: Arc<dyn StatusStore>,
}

/// The broadcast orchestration engine. Cheap to clone; every clone shares
/// the same registry and store.
#[derive(Clone)]
pub struct BroadcastEngine {
    inner: Arc<EngineInner>,
}

impl BroadcastEngine {
    pub fn new(config: Config, store: Arc<dyn StatusStore>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry: SessionRegistry::new(),
                store,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Starts a broadcast.
    ///
    /// Reserves the session slot and resolves the source before anything
    /// spawns, so `AlreadyActive` and `SourceNotFound` are returned to the
    /// caller synchronously. On success the orchestration loop runs as its
    /// own task until a terminal status.
    pub async fn start(&self, request: StartRequest) -> Result<(), StartError> {
        let stop_rx = self
            .inner
            .registry
            .try_reserve(&request.broadcast_id)
            .await
            .map_err(|_| StartError::AlreadyActive(request.broadcast_id.clone()))?;

        // Shuffle applies exactly once per Start; retries keep the order.
        let mut request = request;
        request.source = request.source.shuffled_once();

        let prepared =
            match prepare_source(&request.source, &request.broadcast_id, &self.inner.config).await {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.inner.registry.remove(&request.broadcast_id).await;
                    return Err(e.into());
                }
            };

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_broadcast(request, prepared, stop_rx).await;
        });

        Ok(())
    }

    /// Requests a stop. The owning orchestration loop terminates the
    /// encoder, persists `stopped` and releases the session.
    pub async fn stop(&self, broadcast_id: &str) -> Result<(), StopError> {
        self.inner
            .registry
            .signal_stop(broadcast_id)
            .await
            .map_err(|_| StopError::NotActive(broadcast_id.to_string()))
    }

    pub async fn is_active(&self, broadcast_id: &str) -> bool {
        self.inner.registry.is_active(broadcast_id).await
    }

    pub async fn active_count(&self) -> usize {
        self.inner.registry.active_count().await
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.inner.registry.active_ids().await
    }

    /// Read-only snapshot of every running session.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.registry.snapshot().await
    }

    /// The orchestration loop for one broadcast. Owns the session entry
    /// from reservation to removal.
    async fn run_broadcast(
        &self,
        request: StartRequest,
        first: PreparedSource,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let id = request.broadcast_id.clone();
        info!(
            broadcast_id = %id,
            destination = %request.destination_url,
            "broadcast starting"
        );

        let mut prepared = Some(first);

        // Slow-release destinations get a fixed pre-flight delay before the
        // first spawn only; retries already sit behind a backoff wait.
        if let Some(delay) = quirks::preflight_delay(&request.destination_url) {
            debug!(
                broadcast_id = %id,
                delay_secs = delay.as_secs(),
                "pre-flight delay for slow-release destination"
            );
            let stopped = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                Ok(()) = stop_rx.changed() => true,
            };
            if stopped {
                if let Some(source) = prepared.take() {
                    source.cleanup().await;
                }
                self.finish(&id, BroadcastStatus::Stopped, None).await;
                self.inner.registry.remove(&id).await;
                return;
            }
        }

        let defaults = EncodeDefaults {
            bitrate_kbps: self.inner.config.encoder.default_bitrate_kbps,
            frame_rate: self.inner.config.encoder.default_frame_rate,
        };
        let mut retry = RetryState::new(self.inner.config.retry.max_attempts);
        let mut started_persisted = false;

        loop {
            // Each attempt gets a fresh manifest regenerated from current
            // playlist contents; the first one arrives pre-built from start().
            let source = match prepared.take() {
                Some(source) => source,
                None => match prepare_source(&request.source, &id, &self.inner.config).await {
                    Ok(source) => source,
                    Err(e) => {
                        self.finish(
                            &id,
                            BroadcastStatus::Failed,
                            Some(format!("reconnect aborted: {}", e)),
                        )
                        .await;
                        break;
                    }
                },
            };

            let settings = resolve_settings(&source.probe, &request.overrides, &defaults);
            let outcome = self
                .run_attempt(&request, &source, settings, &mut stop_rx, &mut started_persisted)
                .await;
            source.cleanup().await;

            match outcome {
                AttemptOutcome::Completed => {
                    self.finish(&id, BroadcastStatus::Completed, None).await;
                    break;
                }
                AttemptOutcome::Cancelled => {
                    self.finish(&id, BroadcastStatus::Stopped, None).await;
                    break;
                }
                AttemptOutcome::SpawnFailed(e) => {
                    self.finish(
                        &id,
                        BroadcastStatus::Failed,
                        Some(format!("failed to launch encoder: {}", e)),
                    )
                    .await;
                    break;
                }
                AttemptOutcome::Failed { exit, stalled } => {
                    let stop_requested = *stop_rx.borrow();
                    let kind = if stalled {
                        // A stuck stream is treated as a connection-class
                        // symptom.
                        FailureKind::Connection
                    } else {
                        classify_failure(&exit, stop_requested)
                    };
                    debug!(
                        broadcast_id = %id,
                        kind = %kind,
                        exit = %exit.describe(),
                        "encoder attempt failed"
                    );

                    if kind == FailureKind::UserStop {
                        self.finish(&id, BroadcastStatus::Stopped, None).await;
                        break;
                    }

                    match retry.decide(kind) {
                        RetryDecision::Retry { delay } => {
                            let attempt = retry.attempts + 1;
                            self.inner
                                .registry
                                .set_state(&id, SessionState::Reconnecting { attempt })
                                .await;
                            self.persist(
                                &id,
                                BroadcastStatus::Reconnecting,
                                Some(format!(
                                    "connection lost; reconnect attempt {} of {}",
                                    attempt, retry.max_attempts
                                )),
                            )
                            .await;

                            // A stop request pre-empts the backoff wait.
                            let stopped = tokio::select! {
                                _ = tokio::time::sleep(delay) => false,
                                Ok(()) = stop_rx.changed() => true,
                            };
                            if stopped {
                                self.finish(&id, BroadcastStatus::Stopped, None).await;
                                break;
                            }

                            retry.record_wait(delay);
                        }
                        RetryDecision::GiveUp => {
                            let mut message = if stalled {
                                format!(
                                    "stream stalled: no progress from the encoder within {}s",
                                    self.inner.config.health.stall_timeout_secs
                                )
                            } else {
                                failure_message(kind, &exit)
                            };
                            if kind == FailureKind::Connection {
                                message = format!(
                                    "{}; gave up after {} reconnect attempts",
                                    message, retry.attempts
                                );
                                if let Some(hint) =
                                    quirks::remediation_hint(&request.destination_url)
                                {
                                    message = format!("{}; {}", message, hint);
                                }
                            }
                            self.finish(&id, BroadcastStatus::Failed, Some(message)).await;
                            break;
                        }
                    }
                }
            }
        }

        eprintln!("DBG about to remove {}", id);
        self.inner.registry.remove(&id).await;
        eprintln!("DBG removed {}", id);
        info!(broadcast_id = %id, "broadcast finished");
    }

    /// Spawns and supervises one encoder process to a terminal outcome.
    async fn run_attempt(
        &self,
        request: &StartRequest,
        source: &PreparedSource,
        settings: ResolvedSettings,
        stop_rx: &mut watch::Receiver<bool>,
        started_persisted: &mut bool,
    ) -> AttemptOutcome {
        let id = &request.broadcast_id;
        let config = &self.inner.config;

        let input = match &source.input {
            StreamInput::File { path } => InputSpec::File(path.clone()),
            StreamInput::Manifest(manifest) => InputSpec::Manifest(manifest.path().to_path_buf()),
        };
        let params = StreamParams {
            input,
            needs_silent_audio: source.needs_silent_audio,
            settings,
            preset: config.encoder.preset.clone(),
            audio_bitrate_kbps: config.encoder.audio_bitrate_kbps,
            destination: ingest_url(&request.destination_url, &request.stream_key),
            duration_limit_secs: request.duration_limit_secs,
        };

        let mut process = match spawn_stream(&config.encoder.ffmpeg_path, &params) {
            Ok(process) => process,
            Err(e) => return AttemptOutcome::SpawnFailed(e),
        };

        self.inner.registry.set_state(id, SessionState::Active).await;
        self.persist(id, BroadcastStatus::Active, None).await;
        if !*started_persisted {
            if let Err(e) = self.inner.store.set_started_at(id).await {
                warn!(broadcast_id = %id, error = %e, "failed to stamp start time");
            }
            *started_persisted = true;
        }

        let grace = Duration::from_secs(config.encoder.stop_grace_secs);
        let sample_interval = Duration::from_secs(config.health.bitrate_sample_secs);
        let mut stall = StallDetector::new(
            Duration::from_secs(config.health.stall_timeout_secs),
            Instant::now(),
        );
        let mut quality = BitrateWindow::new(
            config.health.bitrate_window,
            config.health.instability_ratio,
        );
        let mut last_sample = Duration::ZERO;
        let mut sampled_any = false;

        let (status, cancelled, stalled) = loop {
            tokio::select! {
                status = process.child.wait() => {
                    break (status, false, false);
                }
                Some(event) = process.progress.recv() => {
                    stall.touch(Instant::now());

                    // Forward the bitrate to the quality window once per
                    // sample interval of stream time, not per event.
                    if !sampled_any || event.out_time >= last_sample + sample_interval {
                        quality.push(event.bitrate_kbps);
                        last_sample = event.out_time;
                        sampled_any = true;

                        let unstable = quality.is_unstable();
                        self.inner
                            .registry
                            .record_quality(id, event.bitrate_kbps, unstable)
                            .await;
                        if unstable {
                            debug!(
                                broadcast_id = %id,
                                mean_kbps = quality.mean(),
                                std_dev_kbps = quality.std_dev(),
                                "outbound bitrate unstable"
                            );
                        }
                    }
                }
                _ = tokio::time::sleep_until(stall.deadline()) => {
                    warn!(
                        broadcast_id = %id,
                        silent_secs = stall.silence_secs(Instant::now()),
                        "no progress from encoder, terminating attempt"
                    );
                    process.terminate(grace).await;
                    break (process.child.wait().await, false, true);
                }
                Ok(()) = stop_rx.changed() => {
                    info!(broadcast_id = %id, "stop requested, terminating encoder");
                    process.terminate(grace).await;
                    break (process.child.wait().await, true, false);
                }
            }
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return AttemptOutcome::Failed {
                    exit: ProcessExit {
                        code: None,
                        signal: None,
                        stderr_tail: format!("failed to reap encoder process: {}", e),
                    },
                    stalled: false,
                }
            }
        };
        let exit = process.collect_exit(status).await;

        if cancelled {
            return AttemptOutcome::Cancelled;
        }
        if stalled {
            return AttemptOutcome::Failed { exit, stalled: true };
        }
        if exit.success() {
            AttemptOutcome::Completed
        } else {
            AttemptOutcome::Failed { exit, stalled: false }
        }
    }

    /// Persists a non-terminal status transition.
    async fn persist(&self, id: &str, status: BroadcastStatus, message: Option<String>) {
        info!(broadcast_id = %id, status = %status, "status transition");
        if let Err(e) = self.inner.store.update_status(id, status, message).await {
            warn!(broadcast_id = %id, error = %e, "failed to persist status");
        }
    }

    /// Persists a terminal status transition and stamps the end time.
    async fn finish(&self, id: &str, status: BroadcastStatus, message: Option<String>) {
        self.persist(id, status, message).await;
        if let Err(e) = self.inner.store.set_ended_at(id).await {
            warn!(broadcast_id = %id, error = %e, "failed to stamp end time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::AssetPaths;
    use crate::status::MemoryStatusStore;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    const PROBE_JSON_WITH_AUDIO: &str = r#"{"streams":[{"codec_type":"video","codec_name":"h264","width":1280,"height":720,"avg_frame_rate":"30/1","bit_rate":"2500000"},{"codec_type":"audio","codec_name":"aac","channels":2}],"format":{"duration":"60.0","size":"1000000"}}"#;

    const PROBE_JSON_4K_NO_AUDIO: &str = r#"{"streams":[{"codec_type":"video","codec_name":"h264","width":3840,"height":2160,"avg_frame_rate":"24/1","bit_rate":"18000000"}],"format":{"duration":"60.0","size":"9000000"}}"#;

    /// Writes an executable stub script standing in for ffmpeg/ffprobe.
    fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    struct Harness {
        _dir: TempDir,
        engine: BroadcastEngine,
        store: Arc<MemoryStatusStore>,
        asset: AssetPaths,
        work_dir: PathBuf,
    }

    /// Builds an engine wired to stub binaries: `ffmpeg_body` plays the
    /// encoder, `probe_json` is what the fake ffprobe reports.
    fn harness(ffmpeg_body: &str, probe_json: &str, max_attempts: u32) -> Harness {
        let dir = TempDir::new().unwrap();
        let ffmpeg = write_stub(dir.path(), "ffmpeg", ffmpeg_body);
        let ffprobe = write_stub(dir.path(), "ffprobe", &format!("echo '{}'", probe_json));

        let media = dir.path().join("media.mp4");
        std::fs::write(&media, b"media").unwrap();
        let work_dir = dir.path().join("work");

        let mut config = Config::default();
        config.encoder.ffmpeg_path = ffmpeg.to_string_lossy().to_string();
        config.encoder.ffprobe_path = ffprobe.to_string_lossy().to_string();
        config.encoder.stop_grace_secs = 1;
        config.media.work_dir = work_dir.clone();
        config.retry.max_attempts = max_attempts;

        let store = Arc::new(MemoryStatusStore::new());
        let engine = BroadcastEngine::new(config, store.clone());

        Harness {
            asset: AssetPaths {
                converted: media.clone(),
                original: media,
            },
            _dir: dir,
            engine,
            store,
            work_dir,
        }
    }

    fn single_request(h: &Harness, id: &str, destination: &str) -> StartRequest {
        StartRequest {
            broadcast_id: id.to_string(),
            source: SourceSpec::Single {
                asset: h.asset.clone(),
            },
            destination_url: destination.to_string(),
            stream_key: "sk".to_string(),
            duration_limit_secs: None,
            overrides: EncodeOverrides::default(),
        }
    }

    /// Polls the store until the broadcast reaches the given status.
    async fn wait_for_status(h: &Harness, id: &str, status: BroadcastStatus) {
        timeout(Duration::from_secs(10), async {
            loop {
                if let Some(record) = h.store.record(id).await {
                    if record.status == Some(status) {
                        return;
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", status));
    }

    async fn wait_until_released(h: &Harness, id: &str) {
        timeout(Duration::from_secs(10), async {
            while h.engine.is_active(id).await {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was not released");
    }

    #[tokio::test]
    async fn test_clean_exit_completes_and_releases_session() {
        let h = harness("exit 0", PROBE_JSON_WITH_AUDIO, 4);

        h.engine
            .start(single_request(&h, "b1", "rtmp://ingest.example.net/live"))
            .await
            .unwrap();

        wait_for_status(&h, "b1", BroadcastStatus::Completed).await;
        wait_until_released(&h, "b1").await;

        let record = h.store.record("b1").await.unwrap();
        assert_eq!(
            record.history,
            vec![BroadcastStatus::Active, BroadcastStatus::Completed]
        );
        assert!(record.started_at.is_some());
        assert!(record.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_start_missing_source_fails_fast() {
        let h = harness("exit 0", PROBE_JSON_WITH_AUDIO, 4);

        let request = StartRequest {
            source: SourceSpec::Single {
                asset: AssetPaths {
                    converted: PathBuf::from("/nope/a.mp4"),
                    original: PathBuf::from("/nope/a.mov"),
                },
            },
            ..single_request(&h, "b1", "rtmp://ingest.example.net/live")
        };

        match h.engine.start(request).await {
            Err(StartError::Source(SourceError::SourceNotFound { checked })) => {
                assert_eq!(checked.len(), 2);
            }
            other => panic!("expected SourceNotFound, got {:?}", other.map(|_| ())),
        }

        // Nothing spawned, nothing persisted, id free for reuse.
        assert!(!h.engine.is_active("b1").await);
        assert!(h.store.record("b1").await.is_none());
    }

    #[tokio::test]
    async fn test_double_start_is_already_active() {
        let h = harness("sleep 60", PROBE_JSON_WITH_AUDIO, 4);

        h.engine
            .start(single_request(&h, "b1", "rtmp://ingest.example.net/live"))
            .await
            .unwrap();

        match h
            .engine
            .start(single_request(&h, "b1", "rtmp://ingest.example.net/live"))
            .await
        {
            Err(StartError::AlreadyActive(id)) => assert_eq!(id, "b1"),
            other => panic!("expected AlreadyActive, got {:?}", other.map(|_| ())),
        }

        assert_eq!(h.engine.active_count().await, 1);

        h.engine.stop("b1").await.unwrap();
        wait_for_status(&h, "b1", BroadcastStatus::Stopped).await;
        wait_until_released(&h, "b1").await;
    }

    #[tokio::test]
    async fn test_stop_active_broadcast_transitions_to_stopped() {
        let h = harness("sleep 60", PROBE_JSON_WITH_AUDIO, 4);

        h.engine
            .start(single_request(&h, "b1", "rtmp://ingest.example.net/live"))
            .await
            .unwrap();
        wait_for_status(&h, "b1", BroadcastStatus::Active).await;

        h.engine.stop("b1").await.unwrap();
        wait_for_status(&h, "b1", BroadcastStatus::Stopped).await;
        wait_until_released(&h, "b1").await;

        let record = h.store.record("b1").await.unwrap();
        assert_eq!(
            record.history,
            vec![BroadcastStatus::Active, BroadcastStatus::Stopped]
        );
    }

    #[tokio::test]
    async fn test_stop_unknown_broadcast_is_not_active() {
        let h = harness("exit 0", PROBE_JSON_WITH_AUDIO, 4);

        match h.engine.stop("missing").await {
            Err(StopError::NotActive(id)) => assert_eq!(id, "missing"),
            Ok(()) => panic!("stop of an unknown broadcast must fail"),
        }
    }

    #[tokio::test]
    async fn test_connection_failures_retry_then_exhaust() {
        let h = harness("echo 'Connection refused' >&2; exit 1", PROBE_JSON_WITH_AUDIO, 1);

        h.engine
            .start(single_request(&h, "b1", "rtmp://ingest.example.net/live"))
            .await
            .unwrap();

        wait_for_status(&h, "b1", BroadcastStatus::Failed).await;
        wait_until_released(&h, "b1").await;

        let record = h.store.record("b1").await.unwrap();
        // One live attempt, one reconnect wait, one retry attempt, then out
        // of budget.
        assert_eq!(
            record.history,
            vec![
                BroadcastStatus::Active,
                BroadcastStatus::Reconnecting,
                BroadcastStatus::Active,
                BroadcastStatus::Failed,
            ]
        );
        let message = record.error_message.unwrap();
        assert!(message.contains("reconnect attempts"), "got: {}", message);
        assert!(message.to_lowercase().contains("connection"), "got: {}", message);
    }

    #[tokio::test]
    async fn test_fatal_config_failure_is_not_retried() {
        let h = harness(
            "echo '/media/gone.mp4: No such file or directory' >&2; exit 1",
            PROBE_JSON_WITH_AUDIO,
            4,
        );

        h.engine
            .start(single_request(&h, "b1", "rtmp://ingest.example.net/live"))
            .await
            .unwrap();

        wait_for_status(&h, "b1", BroadcastStatus::Failed).await;
        wait_until_released(&h, "b1").await;

        let record = h.store.record("b1").await.unwrap();
        assert!(!record.history.contains(&BroadcastStatus::Reconnecting));
        assert!(record
            .error_message
            .unwrap()
            .contains("No such file or directory"));
    }

    #[tokio::test]
    async fn test_stop_during_backoff_preempts_the_wait() {
        // Fail fast so the loop parks in its first backoff (1s).
        let h = harness("echo 'Connection refused' >&2; exit 1", PROBE_JSON_WITH_AUDIO, 8);

        h.engine
            .start(single_request(&h, "b1", "rtmp://ingest.example.net/live"))
            .await
            .unwrap();
        wait_for_status(&h, "b1", BroadcastStatus::Reconnecting).await;

        let stop_issued = std::time::Instant::now();
        h.engine.stop("b1").await.unwrap();
        wait_for_status(&h, "b1", BroadcastStatus::Stopped).await;

        // The stop must land well before the 1s backoff elapses.
        assert!(stop_issued.elapsed() < Duration::from_millis(800));
        wait_until_released(&h, "b1").await;

        // No further attempt was spawned after the stop.
        let record = h.store.record("b1").await.unwrap();
        assert_eq!(record.history.last(), Some(&BroadcastStatus::Stopped));
        let actives = record
            .history
            .iter()
            .filter(|s| **s == BroadcastStatus::Active)
            .count();
        assert_eq!(actives, 1);
    }

    #[tokio::test]
    async fn test_silent_audio_and_native_settings_reach_the_encoder() {
        let dir = TempDir::new().unwrap();
        let args_file = dir.path().join("args.txt");
        let body = format!("printf '%s\\n' \"$@\" > {}; exit 0", args_file.display());

        let h = harness(&body, PROBE_JSON_4K_NO_AUDIO, 4);

        h.engine
            .start(single_request(&h, "b1", "rtmp://ingest.example.net/live"))
            .await
            .unwrap();
        wait_for_status(&h, "b1", BroadcastStatus::Completed).await;
        wait_until_released(&h, "b1").await;

        let args = std::fs::read_to_string(&args_file).unwrap();
        let args: Vec<&str> = args.lines().collect();

        // No overrides: native bitrate, frame rate and resolution.
        assert!(args.contains(&"-b:v"));
        assert!(args.contains(&"18000k"));
        assert!(args.contains(&"scale=3840:2160"));
        assert!(args.contains(&"24"));

        // No audio track in the source: synthetic silent audio mapped in.
        assert!(args.iter().any(|a| a.contains("anullsrc")));
        assert!(args.contains(&"-shortest"));

        // Ingest URL with the stream key lands as the output.
        assert_eq!(args.last(), Some(&"rtmp://ingest.example.net/live/sk"));
    }

    #[tokio::test]
    async fn test_playlist_manifest_removed_after_terminal_exit() {
        let h = harness("echo 'Connection refused' >&2; exit 1", PROBE_JSON_WITH_AUDIO, 1);

        let request = StartRequest {
            source: SourceSpec::Playlist {
                items: vec![h.asset.clone(), h.asset.clone(), h.asset.clone()],
                shuffle: false,
                loop_playback: true,
            },
            ..single_request(&h, "b1", "rtmp://ingest.example.net/live")
        };

        h.engine.start(request).await.unwrap();
        wait_for_status(&h, "b1", BroadcastStatus::Failed).await;
        wait_until_released(&h, "b1").await;

        // Every attempt's manifest was cleaned up on its terminal exit.
        let leftovers: Vec<_> = std::fs::read_dir(&h.work_dir)
            .map(|entries| entries.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "leftover manifests: {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_quirky_destination_delays_first_spawn() {
        let h = harness("sleep 60", PROBE_JSON_WITH_AUDIO, 4);

        h.engine
            .start(single_request(&h, "b1", "rtmps://live-api-s.facebook.com:443/rtmp"))
            .await
            .unwrap();

        // Well within the pre-flight delay: reserved but nothing spawned,
        // so no Active transition has been persisted yet.
        sleep(Duration::from_millis(600)).await;
        assert!(h.engine.is_active("b1").await);
        assert!(h.store.record("b1").await.is_none());

        // A stop during the pre-flight delay is honored immediately.
        h.engine.stop("b1").await.unwrap();
        wait_for_status(&h, "b1", BroadcastStatus::Stopped).await;
        wait_until_released(&h, "b1").await;

        let record = h.store.record("b1").await.unwrap();
        assert_eq!(record.history, vec![BroadcastStatus::Stopped]);
    }

    #[tokio::test]
    async fn test_registry_queries_reflect_running_broadcasts() {
        let h = harness("sleep 60", PROBE_JSON_WITH_AUDIO, 4);

        h.engine
            .start(single_request(&h, "a", "rtmp://ingest.example.net/live"))
            .await
            .unwrap();
        h.engine
            .start(single_request(&h, "b", "rtmp://ingest.example.net/live"))
            .await
            .unwrap();

        wait_for_status(&h, "a", BroadcastStatus::Active).await;
        wait_for_status(&h, "b", BroadcastStatus::Active).await;

        assert_eq!(h.engine.active_count().await, 2);
        let mut ids = h.engine.active_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        let sessions = h.engine.sessions().await;
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.state == "active"));

        h.engine.stop("a").await.unwrap();
        h.engine.stop("b").await.unwrap();
        wait_until_released(&h, "a").await;
        wait_until_released(&h, "b").await;
        assert_eq!(h.engine.active_count().await, 0);
    }
}
