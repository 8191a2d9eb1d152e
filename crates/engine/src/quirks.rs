//! Destination-specific quirks.
//!
//! Some ingest platforms hold a previous connection open for a while after
//! the publisher disappears and reject a fresh publish with "already
//! publishing" until it drains. For those destinations a fixed pre-flight
//! delay runs before the first spawn of a broadcast - not before retries,
//! which already sit behind a backoff wait. Matching is a plain substring
//! allow-list, not a plugin system.

use std::time::Duration;

/// Destinations whose ingest releases a dropped connection slowly, paired
/// with the pre-flight delay applied before the first spawn.
const SLOW_RELEASE_DESTINATIONS: &[(&str, u64)] = &[
    ("facebook.com", 5),
    ("fb.me", 5),
    ("instagram.com", 5),
    ("trovo.live", 3),
];

/// Destinations with a known remediation story worth appending to an
/// exhausted-reconnect failure message.
const REMEDIATION_HINTS: &[(&str, &str)] = &[
    (
        "facebook.com",
        "this destination is known to hold stale connections; wait a minute \
         before restarting the broadcast",
    ),
    (
        "instagram.com",
        "this destination is known to hold stale connections; wait a minute \
         before restarting the broadcast",
    ),
    (
        "youtube.com",
        "verify the stream key is still valid; this destination rotates keys \
         when a live event ends",
    ),
];

/// Pre-flight delay for the destination, None when it has no known quirk.
pub fn preflight_delay(destination_url: &str) -> Option<Duration> {
    let lower = destination_url.to_lowercase();
    SLOW_RELEASE_DESTINATIONS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, secs)| Duration::from_secs(*secs))
}

/// Destination-specific remediation hint, None when there is nothing
/// useful to say.
pub fn remediation_hint(destination_url: &str) -> Option<&'static str> {
    let lower = destination_url.to_lowercase();
    REMEDIATION_HINTS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, hint)| *hint)
}
