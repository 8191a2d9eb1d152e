//! Encode parameter resolution.
//!
//! Turns probe data plus optional caller overrides into a fully-resolved
//! settings struct with no remaining "auto" values. Pure function of its
//! inputs; the supervisor consumes the result verbatim when building the
//! encoder command line.

use crate::probe::ProbeResult;
use serde::{Deserialize, Serialize};

/// Minimum output height. Sources shorter than this are upscaled.
const MIN_HEIGHT: u32 = 480;

/// Resolution tiers accepted as overrides, mapped to fixed dimensions.
/// An unrecognized tier name falls back to the source's native resolution.
const RESOLUTION_TIERS: &[(&str, (u32, u32))] = &[
    ("480p", (854, 480)),
    ("720p", (1280, 720)),
    ("1080p", (1920, 1080)),
    ("1440p", (2560, 1440)),
    ("2160p", (3840, 2160)),
];

/// Dimensions assumed when the probe carries no usable video stream.
/// Source preparation rejects such files before resolution normally runs.
const FALLBACK_DIMENSIONS: (u32, u32) = (1280, 720);

/// Output orientation requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Landscape,
    Portrait,
}

/// Caller-supplied encode overrides. All fields optional; `None` means
/// "derive from the source".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodeOverrides {
    /// Resolution tier name ("720p", "1080p", ...).
    #[serde(default)]
    pub resolution: Option<String>,
    /// Video bitrate in kbps.
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    /// Output frame rate.
    #[serde(default)]
    pub frame_rate: Option<u32>,
    /// Output orientation.
    #[serde(default)]
    pub orientation: Option<Orientation>,
}

impl EncodeOverrides {
    /// True when the caller supplied no overrides at all.
    pub fn is_empty(&self) -> bool {
        self.resolution.is_none()
            && self.bitrate_kbps.is_none()
            && self.frame_rate.is_none()
            && self.orientation.is_none()
    }
}

/// Defaults used for fields the caller left unset when at least one
/// override is present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeDefaults {
    pub bitrate_kbps: u32,
    pub frame_rate: u32,
}

/// Fully-resolved encode settings. No "auto" values remain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSettings {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub maxrate_kbps: u32,
    pub bufsize_kbps: u32,
    pub frame_rate: u32,
}

/// Resolves output settings from probe data and optional overrides.
///
/// Resolution rules:
/// - No overrides at all: the source's native bitrate/frame-rate/resolution,
///   with height clamped to at least 480 and width forced even.
/// - Any override present: overridden fields win; unspecified fields fall
///   back to the native resolution (same clamping) and the configured
///   default bitrate/frame-rate.
/// - `maxrate` and `bufsize` derive deterministically from the chosen
///   bitrate (1.5x and 2x).
pub fn resolve_settings(
    probe: &ProbeResult,
    overrides: &EncodeOverrides,
    defaults: &EncodeDefaults,
) -> ResolvedSettings {
    let native = probe
        .primary_video()
        .filter(|v| v.width > 0 && v.height > 0)
        .map(|v| (v.width, v.height))
        .unwrap_or(FALLBACK_DIMENSIONS);

    let (mut width, mut height) = if let Some(tier) = overrides.resolution.as_deref() {
        tier_dimensions(tier).unwrap_or_else(|| clamp_native(native))
    } else {
        clamp_native(native)
    };

    if let Some(orientation) = overrides.orientation {
        (width, height) = apply_orientation(width, height, orientation);
    }

    let (bitrate_kbps, frame_rate) = if overrides.is_empty() {
        // Prefer what the source itself carries.
        let native_bitrate = probe
            .primary_video()
            .and_then(|v| v.bitrate_kbps)
            .filter(|b| *b > 0.0)
            .map(|b| b.round() as u32)
            .unwrap_or(defaults.bitrate_kbps);
        let native_rate = probe
            .primary_video()
            .and_then(|v| v.frame_rate)
            .filter(|r| *r > 0.0)
            .map(|r| r.round() as u32)
            .unwrap_or(defaults.frame_rate);
        (native_bitrate, native_rate)
    } else {
        (
            overrides.bitrate_kbps.unwrap_or(defaults.bitrate_kbps),
            overrides.frame_rate.unwrap_or(defaults.frame_rate),
        )
    };

    ResolvedSettings {
        width,
        height,
        bitrate_kbps,
        maxrate_kbps: bitrate_kbps + bitrate_kbps / 2,
        bufsize_kbps: bitrate_kbps * 2,
        frame_rate,
    }
}

/// Maps a tier name to fixed dimensions, None when unrecognized.
pub fn tier_dimensions(tier: &str) -> Option<(u32, u32)> {
    RESOLUTION_TIERS
        .iter()
        .find(|(name, _)| *name == tier)
        .map(|(_, dims)| *dims)
}

/// Clamps native dimensions to the minimum height and forces the width even.
fn clamp_native((width, height): (u32, u32)) -> (u32, u32) {
    let (w, h) = if height < MIN_HEIGHT {
        let scaled = (width as f64 * MIN_HEIGHT as f64 / height as f64).round() as u32;
        (scaled, MIN_HEIGHT)
    } else {
        (width, height)
    };

    (force_even(w), h)
}

/// Rounds down to the nearest even value, never below 2.
fn force_even(value: u32) -> u32 {
    (value - value % 2).max(2)
}

/// Arranges dimensions to match the requested orientation.
fn apply_orientation(width: u32, height: u32, orientation: Orientation) -> (u32, u32) {
    let (long, short) = (width.max(height), width.min(height));
    match orientation {
        Orientation::Landscape => (long, short),
        Orientation::Portrait => (short, long),
    }
}
