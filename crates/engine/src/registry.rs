//! Session registry: the single source of truth for "is this broadcast
//! active".
//!
//! One mutex-guarded table keyed by broadcast id. Reservation is an atomic
//! check-then-insert so two Start calls for the same id can never both
//! spawn; only the orchestration loop that owns an entry removes or
//! replaces it. Stop requests are delivered through a per-session watch
//! channel, which lets the owning loop pre-empt subprocess waits and
//! pending backoff delays alike.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// Error type for registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A session for this broadcast already exists.
    #[error("broadcast {0} is already active")]
    AlreadyActive(String),

    /// No session exists for this broadcast.
    #[error("broadcast {0} is not active")]
    NotActive(String),
}

/// In-memory state of one running broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reserved; the first encoder spawn has not happened yet.
    Starting,
    /// The encoder process is running.
    Active,
    /// Between attempts, waiting out a backoff delay.
    Reconnecting { attempt: u32 },
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Reconnecting { .. } => "reconnecting",
        }
    }
}

/// One registered broadcast session. Owned exclusively by the registry.
#[derive(Debug)]
struct BroadcastSession {
    started_at: Instant,
    state: SessionState,
    last_bitrate_kbps: Option<f32>,
    bitrate_unstable: bool,
    stop_tx: watch::Sender<bool>,
}

/// Read-only view of a session for the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub broadcast_id: String,
    pub state: String,
    pub reconnect_attempt: Option<u32>,
    pub uptime_secs: u64,
    pub last_bitrate_kbps: Option<f32>,
    pub bitrate_unstable: bool,
}

/// The concurrent map of broadcast id to running session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, BroadcastSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically reserves a session slot for the broadcast.
    ///
    /// Returns the stop-signal receiver the orchestration loop watches.
    /// Fails with `AlreadyActive` when a session for the id exists,
    /// whatever state it is in.
    pub async fn try_reserve(&self, broadcast_id: &str) -> Result<watch::Receiver<bool>, RegistryError> {
        let mut sessions = self.sessions.lock().await;

        if sessions.contains_key(broadcast_id) {
            return Err(RegistryError::AlreadyActive(broadcast_id.to_string()));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        sessions.insert(
            broadcast_id.to_string(),
            BroadcastSession {
                started_at: Instant::now(),
                state: SessionState::Starting,
                last_bitrate_kbps: None,
                bitrate_unstable: false,
                stop_tx,
            },
        );

        Ok(stop_rx)
    }

    /// Signals the owning orchestration loop to stop.
    pub async fn signal_stop(&self, broadcast_id: &str) -> Result<(), RegistryError> {
        let sessions = self.sessions.lock().await;
        match sessions.get(broadcast_id) {
            Some(session) => {
                let _ = session.stop_tx.send(true);
                Ok(())
            }
            None => Err(RegistryError::NotActive(broadcast_id.to_string())),
        }
    }

    /// Removes the session on terminal exit. Only the owning loop calls this.
    pub async fn remove(&self, broadcast_id: &str) -> bool {
        self.sessions.lock().await.remove(broadcast_id).is_some()
    }

    /// Updates the session's lifecycle state.
    pub async fn set_state(&self, broadcast_id: &str, state: SessionState) {
        if let Some(session) = self.sessions.lock().await.get_mut(broadcast_id) {
            session.state = state;
        }
    }

    /// Records sampled network-quality telemetry for the session.
    pub async fn record_quality(&self, broadcast_id: &str, bitrate_kbps: f32, unstable: bool) {
        if let Some(session) = self.sessions.lock().await.get_mut(broadcast_id) {
            session.last_bitrate_kbps = Some(bitrate_kbps);
            session.bitrate_unstable = unstable;
        }
    }

    pub async fn is_active(&self, broadcast_id: &str) -> bool {
        self.sessions.lock().await.contains_key(broadcast_id)
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Read-only snapshot of every session, for the status surface.
    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(id, session)| SessionInfo {
                broadcast_id: id.clone(),
                state: session.state.as_str().to_string(),
                reconnect_attempt: match session.state {
                    SessionState::Reconnecting { attempt } => Some(attempt),
                    _ => None,
                },
                uptime_secs: now.saturating_duration_since(session.started_at).as_secs(),
                last_bitrate_kbps: session.last_bitrate_kbps,
                bitrate_unstable: session.bitrate_unstable,
            })
            .collect()
    }
}
