//! Source preparation.
//!
//! Converts a broadcast's source descriptor (one asset or an ordered
//! playlist) into something the encoder can consume as one continuous
//! input. Path resolution walks a fixed search order (converted path,
//! original upload, legacy library prefix); playlists become an ffconcat
//! manifest, repeated a large fixed number of times when looping is
//! requested. Preparation either yields a ready input descriptor or fails
//! before any process is spawned - never mid-stream.

use crate::probe::{probe_file, ProbeError, ProbeResult};
use livecast_config::Config;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Error type for source preparation.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No playable file exists for one or more assets.
    #[error("no playable file found; checked paths: {checked:?}")]
    SourceNotFound { checked: Vec<PathBuf> },

    /// The source exists but cannot be broadcast.
    #[error("invalid source: {0}")]
    SourceInvalid(String),

    /// Probing the source failed.
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// Writing the playlist manifest failed.
    #[error("failed to write playlist manifest: {0}")]
    Manifest(std::io::Error),
}

/// Stored locations of one media asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetPaths {
    /// Path of the converted, broadcast-ready file.
    pub converted: PathBuf,
    /// Path of the original upload.
    pub original: PathBuf,
}

/// What a broadcast streams: one asset or an ordered playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Single {
        asset: AssetPaths,
    },
    Playlist {
        items: Vec<AssetPaths>,
        #[serde(default)]
        shuffle: bool,
        #[serde(default)]
        loop_playback: bool,
    },
}

impl SourceSpec {
    /// Applies the playlist's shuffle flag exactly once, consuming it.
    ///
    /// Called once per Start; retry attempts regenerate the manifest from
    /// the already-permuted order without reshuffling.
    pub fn shuffled_once(self) -> Self {
        self.shuffled_with(&mut rand::thread_rng())
    }

    /// Shuffle with a caller-supplied RNG (uniform, via `SliceRandom`).
    pub fn shuffled_with<R: Rng>(mut self, rng: &mut R) -> Self {
        if let SourceSpec::Playlist { items, shuffle, .. } = &mut self {
            if *shuffle {
                items.shuffle(rng);
                *shuffle = false;
            }
        }
        self
    }
}

/// Ephemeral ffconcat manifest backing one broadcast attempt.
///
/// Exclusive to the attempt that created it; removed on that attempt's
/// terminal exit and regenerated from current playlist contents on retry.
#[derive(Debug)]
pub struct PlaylistManifest {
    path: PathBuf,
    /// Number of `file` entries written.
    pub entries: usize,
}

impl PlaylistManifest {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the manifest file. Missing files are fine (crash-restart).
    pub async fn cleanup(&self) {
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

/// The encoder-facing input for one attempt.
#[derive(Debug)]
pub enum StreamInput {
    /// A single file input.
    File { path: PathBuf },
    /// An ffconcat manifest input.
    Manifest(PlaylistManifest),
}

/// A fully-prepared source, ready to hand to the process supervisor.
#[derive(Debug)]
pub struct PreparedSource {
    pub input: StreamInput,
    /// The source carries no audio track; the supervisor must synthesize
    /// silent audio so the outbound stream always has one.
    pub needs_silent_audio: bool,
    /// Probe of the (first) source file, for parameter resolution.
    pub probe: ProbeResult,
}

impl PreparedSource {
    /// Releases the attempt's manifest artifact, if any.
    pub async fn cleanup(&self) {
        if let StreamInput::Manifest(manifest) = &self.input {
            manifest.cleanup().await;
        }
    }
}

/// Prepares a broadcast source for one attempt.
pub async fn prepare_source(
    spec: &SourceSpec,
    broadcast_id: &str,
    cfg: &Config,
) -> Result<PreparedSource, SourceError> {
    match spec {
        SourceSpec::Single { asset } => {
            let path = resolve_asset(asset, cfg.media.legacy_prefix.as_deref())
                .await
                .map_err(|checked| SourceError::SourceNotFound { checked })?;

            let probe = probe_file(&cfg.encoder.ffprobe_path, &path).await?;
            if probe.video_streams.is_empty() {
                return Err(SourceError::SourceInvalid(format!(
                    "{} has no video streams",
                    path.display()
                )));
            }

            Ok(PreparedSource {
                needs_silent_audio: !probe.has_audio(),
                probe,
                input: StreamInput::File { path },
            })
        }
        SourceSpec::Playlist {
            items,
            loop_playback,
            ..
        } => {
            if items.is_empty() {
                return Err(SourceError::SourceInvalid(
                    "playlist has no items".to_string(),
                ));
            }

            // Resolve every member, aggregating all missing paths so the
            // caller sees the full picture in one failure.
            let mut resolved = Vec::with_capacity(items.len());
            let mut missing = Vec::new();
            for item in items {
                match resolve_asset(item, cfg.media.legacy_prefix.as_deref()).await {
                    Ok(path) => resolved.push(path),
                    Err(checked) => missing.extend(checked),
                }
            }
            if !missing.is_empty() {
                return Err(SourceError::SourceNotFound { checked: missing });
            }

            // Audio presence is probed on the first member only and assumed
            // uniform across the playlist.
            let probe = probe_file(&cfg.encoder.ffprobe_path, &resolved[0]).await?;

            let repeats = if *loop_playback {
                cfg.playlist.loop_repeats.max(1)
            } else {
                1
            };
            let manifest = write_manifest(&resolved, repeats, broadcast_id, &cfg.media.work_dir)
                .await?;

            debug!(
                broadcast_id,
                entries = manifest.entries,
                manifest = %manifest.path().display(),
                "playlist manifest written"
            );

            Ok(PreparedSource {
                needs_silent_audio: !probe.has_audio(),
                probe,
                input: StreamInput::Manifest(manifest),
            })
        }
    }
}

/// Resolves an asset through the path search order, returning the first
/// path that exists or the full list of paths checked.
pub async fn resolve_asset(
    asset: &AssetPaths,
    legacy_prefix: Option<&Path>,
) -> Result<PathBuf, Vec<PathBuf>> {
    let candidates = candidate_paths(asset, legacy_prefix);
    for candidate in &candidates {
        if tokio::fs::metadata(candidate).await.is_ok() {
            return Ok(candidate.clone());
        }
    }
    Err(candidates)
}

/// Search order: converted path, original upload, legacy-prefix fallback.
fn candidate_paths(asset: &AssetPaths, legacy_prefix: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = vec![asset.converted.clone(), asset.original.clone()];
    if let Some(prefix) = legacy_prefix {
        if let Some(name) = asset.converted.file_name() {
            candidates.push(prefix.join(name));
        }
    }
    candidates
}

/// Builds ffconcat manifest text: the resolved list repeated `repeats`
/// times, preserving relative order within each cycle.
pub fn manifest_contents(paths: &[PathBuf], repeats: u32) -> String {
    let mut out = String::from("ffconcat version 1.0\n");
    for _ in 0..repeats {
        for path in paths {
            // Single quotes inside a quoted ffconcat path close, escape, reopen.
            let escaped = path.to_string_lossy().replace('\'', "'\\''");
            out.push_str("file '");
            out.push_str(&escaped);
            out.push_str("'\n");
        }
    }
    out
}

async fn write_manifest(
    paths: &[PathBuf],
    repeats: u32,
    broadcast_id: &str,
    work_dir: &Path,
) -> Result<PlaylistManifest, SourceError> {
    tokio::fs::create_dir_all(work_dir)
        .await
        .map_err(SourceError::Manifest)?;

    let file_name = format!("playlist-{}-{}.ffconcat", broadcast_id, Uuid::new_v4());
    let path = work_dir.join(file_name);
    let contents = manifest_contents(paths, repeats);

    tokio::fs::write(&path, contents)
        .await
        .map_err(SourceError::Manifest)?;

    Ok(PlaylistManifest {
        path,
        entries: paths.len() * repeats as usize,
    })
}
