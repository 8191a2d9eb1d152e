//! Classifier module for categorizing encoder process failures.
//!
//! Inspects a dead encoder's exit signal and stderr text to label the
//! failure. The label decides what the reconnection controller may do with
//! it: only connection-class failures are ever retried.

use crate::encode::ProcessExit;
use serde::{Deserialize, Serialize};

// Signal numbers the classifier cares about. Kept as local constants so the
// classification stays testable on any host platform.
const SIGKILL: i32 = 9;
const SIGSEGV: i32 = 11;
const SIGTERM: i32 = 15;

// ffmpeg traps the graceful stop signal and exits with this code instead of
// dying from the signal itself.
const SIGNAL_EXIT_CODE: i32 = 255;

/// Classification of an encoder process failure.
///
/// Exactly one kind per failure, decided in priority order: a fault signal
/// must never be mis-read as a benign user stop, and a connection error is
/// not retried when it also carries a fatal-config signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The process died from the stop signals an explicit stop request
    /// issues. Not an error.
    UserStop,
    /// The process died from a fault signal. Not retried.
    Crash,
    /// Unrecoverable misconfiguration (missing input, permissions,
    /// unsupported encoder/option). Not retried.
    FatalConfig,
    /// The process ran out of memory. Not retried automatically.
    MemoryPressure,
    /// Network/connection failure talking to the ingest endpoint. Eligible
    /// for retry.
    Connection,
    /// Anything else. Surfaced rather than silently retried.
    Unclassified,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::UserStop => write!(f, "user_stop"),
            FailureKind::Crash => write!(f, "crash"),
            FailureKind::FatalConfig => write!(f, "fatal_config"),
            FailureKind::MemoryPressure => write!(f, "memory_pressure"),
            FailureKind::Connection => write!(f, "connection"),
            FailureKind::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Patterns indicating unrecoverable misconfiguration.
const FATAL_CONFIG_PATTERNS: &[&str] = &[
    "no such file or directory",
    "permission denied",
    "unknown encoder",
    "encoder not found",
    "unrecognized option",
    "option not found",
    "error opening input",
    "invalid data found when processing input",
    "does not contain any stream",
];

/// Patterns indicating memory exhaustion.
const MEMORY_PATTERNS: &[&str] = &[
    "cannot allocate memory",
    "out of memory",
    "failed to allocate",
    "allocation failed",
];

/// Patterns indicating a network/connection failure.
const CONNECTION_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timed out",
    "broken pipe",
    "network is unreachable",
    "host is unreachable",
    "no route to host",
    "failed to connect",
    "connection closed",
    "end of file",
    "i/o error",
    "econnreset",
    "etimedout",
    "epipe",
];

/// Classifies a dead encoder process into exactly one failure kind.
///
/// Priority order:
/// 1. UserStop - the stop-request signal pair, only after an explicit stop
/// 2. Crash - fault signal (segmentation violation)
/// 3. FatalConfig - stderr matches a misconfiguration pattern
/// 4. MemoryPressure - stderr matches an out-of-memory pattern
/// 5. Connection - stderr matches a network pattern
/// 6. Unclassified - anything else
pub fn classify_failure(exit: &ProcessExit, stop_requested: bool) -> FailureKind {
    // A stop request terminates with SIGTERM then SIGKILL; ffmpeg usually
    // catches the former and exits 255. A fault signal takes priority even
    // when a stop was pending.
    if exit.signal == Some(SIGSEGV) {
        return FailureKind::Crash;
    }

    if stop_requested
        && (matches!(exit.signal, Some(SIGTERM) | Some(SIGKILL))
            || exit.code == Some(SIGNAL_EXIT_CODE))
    {
        return FailureKind::UserStop;
    }

    let stderr = exit.stderr_tail.to_lowercase();

    if contains_any_pattern(&stderr, FATAL_CONFIG_PATTERNS) {
        return FailureKind::FatalConfig;
    }

    if contains_any_pattern(&stderr, MEMORY_PATTERNS) {
        return FailureKind::MemoryPressure;
    }

    if contains_any_pattern(&stderr, CONNECTION_PATTERNS) {
        return FailureKind::Connection;
    }

    FailureKind::Unclassified
}

/// Checks if the stderr text contains any of the given patterns.
fn contains_any_pattern(stderr: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| stderr.contains(p))
}

/// Builds the persisted, user-actionable message for a classified failure.
pub fn failure_message(kind: FailureKind, exit: &ProcessExit) -> String {
    match kind {
        FailureKind::UserStop => "stopped by user request".to_string(),
        FailureKind::Crash => format!(
            "encoder crashed with signal {} (segmentation fault); the source \
             file may be corrupt or use an unsupported codec - try re-encoding \
             it before broadcasting",
            exit.signal.unwrap_or(SIGSEGV)
        ),
        FailureKind::FatalConfig => format!(
            "encoder rejected the configuration: {}",
            first_matching_line(&exit.stderr_tail, FATAL_CONFIG_PATTERNS)
                .unwrap_or_else(|| "unrecoverable configuration error".to_string())
        ),
        FailureKind::MemoryPressure => {
            "encoder ran out of memory; lower the output resolution or bitrate, \
             or free memory on the host"
                .to_string()
        }
        FailureKind::Connection => format!(
            "connection to the ingest endpoint failed: {}",
            first_matching_line(&exit.stderr_tail, CONNECTION_PATTERNS)
                .unwrap_or_else(|| "network error".to_string())
        ),
        FailureKind::Unclassified => format!(
            "encoder exited unexpectedly ({}): {}",
            exit.describe(),
            last_nonempty_line(&exit.stderr_tail).unwrap_or_else(|| "no diagnostic output".to_string())
        ),
    }
}

/// First stderr line containing one of the patterns, trimmed.
fn first_matching_line(stderr: &str, patterns: &[&str]) -> Option<String> {
    stderr
        .lines()
        .find(|line| {
            let lower = line.to_lowercase();
            patterns.iter().any(|p| lower.contains(p))
        })
        .map(|line| line.trim().to_string())
}

/// Last non-empty stderr line, trimmed.
fn last_nonempty_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
