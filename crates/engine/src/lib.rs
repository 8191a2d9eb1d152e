//! Livecast broadcast orchestration engine
//!
//! Turns stored media assets into continuously-running outbound RTMP
//! streams: supervises the external ffmpeg process, classifies its
//! failures, and drives reconnection with bounded backoff.

pub mod classify;
pub mod encode;
pub mod engine;
pub mod health;
pub mod params;
pub mod probe;
pub mod quirks;
pub mod registry;
pub mod retry;
pub mod server;
pub mod source;
pub mod startup;
pub mod status;

pub use classify::{classify_failure, failure_message, FailureKind};
pub use encode::{
    build_stream_command, ingest_url, spawn_stream, EncodeError, InputSpec, ProcessExit,
    ProgressEvent, ProgressParser, StreamParams, StreamProcess,
};
pub use engine::{BroadcastEngine, StartError, StartRequest, StopError};
pub use health::{BitrateWindow, StallDetector};
pub use livecast_config as config;
pub use livecast_config::Config;
pub use params::{
    resolve_settings, tier_dimensions, EncodeDefaults, EncodeOverrides, Orientation,
    ResolvedSettings,
};
pub use probe::{parse_ffprobe_output, probe_file, ProbeError, ProbeResult};
pub use registry::{RegistryError, SessionInfo, SessionRegistry, SessionState};
pub use retry::{backoff_delay, RetryDecision, RetryState};
pub use server::{
    collect_system_metrics, create_router, run_server, EngineSnapshot, ServerError, StartBody,
    SystemMetrics,
};
pub use source::{
    prepare_source, resolve_asset, AssetPaths, PlaylistManifest, PreparedSource, SourceError,
    SourceSpec, StreamInput,
};
pub use startup::{
    check_ffmpeg_available, check_ffprobe_available, parse_ffmpeg_version, run_startup_checks,
    StartupError,
};
pub use status::{BroadcastStatus, MemoryStatusStore, StatusStore, StoreError};
