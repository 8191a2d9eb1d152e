//! Encoder subprocess supervision: command construction, progress parsing,
//! and lifecycle control for the external ffmpeg process.

pub mod ffmpeg;

pub use ffmpeg::{
    build_stream_command, ingest_url, spawn_stream, EncodeError, InputSpec, ProcessExit,
    ProgressEvent, ProgressParser, StreamParams, StreamProcess,
};
