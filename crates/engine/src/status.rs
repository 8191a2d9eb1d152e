//! Persisted broadcast status.
//!
//! The engine does not own broadcast records; it mutates their status,
//! error message and timestamps through the `StatusStore` write path as a
//! side effect of state transitions. The CRUD layer owns everything else.
//! `MemoryStatusStore` backs tests and the standalone daemon binary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::RwLock;

/// Persisted lifecycle status of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Scheduled,
    Offline,
    Active,
    Reconnecting,
    Completed,
    Failed,
    Stopped,
}

impl BroadcastStatus {
    /// Convert status to string for persistence and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::Scheduled => "scheduled",
            BroadcastStatus::Offline => "offline",
            BroadcastStatus::Active => "active",
            BroadcastStatus::Reconnecting => "reconnecting",
            BroadcastStatus::Completed => "completed",
            BroadcastStatus::Failed => "failed",
            BroadcastStatus::Stopped => "stopped",
        }
    }

    /// Terminal statuses end a broadcast's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BroadcastStatus::Completed | BroadcastStatus::Failed | BroadcastStatus::Stopped
        )
    }
}

impl std::fmt::Display for BroadcastStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error surfaced by a status store backend.
#[derive(Debug, Error)]
#[error("status store error: {0}")]
pub struct StoreError(pub String);

/// The engine's single write path into the external record store.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Persists a status transition with an optional error message.
    async fn update_status(
        &self,
        broadcast_id: &str,
        status: BroadcastStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;

    /// Stamps the broadcast's start time if not already set.
    async fn set_started_at(&self, broadcast_id: &str) -> Result<(), StoreError>;

    /// Stamps the broadcast's end time.
    async fn set_ended_at(&self, broadcast_id: &str) -> Result<(), StoreError>;
}

/// One broadcast's persisted state in the in-memory store.
#[derive(Debug, Clone, Default)]
pub struct StatusRecord {
    pub status: Option<BroadcastStatus>,
    pub error_message: Option<String>,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
    /// Every transition in order, for inspection.
    pub history: Vec<BroadcastStatus>,
}

/// In-memory status store.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: RwLock<HashMap<String, StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a broadcast's record, if any transition was persisted.
    pub async fn record(&self, broadcast_id: &str) -> Option<StatusRecord> {
        self.records.read().await.get(broadcast_id).cloned()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn update_status(
        &self,
        broadcast_id: &str,
        status: BroadcastStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records.entry(broadcast_id.to_string()).or_default();
        record.status = Some(status);
        record.error_message = error_message;
        record.history.push(status);
        Ok(())
    }

    async fn set_started_at(&self, broadcast_id: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records.entry(broadcast_id.to_string()).or_default();
        if record.started_at.is_none() {
            record.started_at = Some(SystemTime::now());
        }
        Ok(())
    }

    async fn set_ended_at(&self, broadcast_id: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records.entry(broadcast_id.to_string()).or_default();
        record.ended_at = Some(SystemTime::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_as_str() {
        assert_eq!(BroadcastStatus::Scheduled.as_str(), "scheduled");
        assert_eq!(BroadcastStatus::Offline.as_str(), "offline");
        assert_eq!(BroadcastStatus::Active.as_str(), "active");
        assert_eq!(BroadcastStatus::Reconnecting.as_str(), "reconnecting");
        assert_eq!(BroadcastStatus::Completed.as_str(), "completed");
        assert_eq!(BroadcastStatus::Failed.as_str(), "failed");
        assert_eq!(BroadcastStatus::Stopped.as_str(), "stopped");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(BroadcastStatus::Completed.is_terminal());
        assert!(BroadcastStatus::Failed.is_terminal());
        assert!(BroadcastStatus::Stopped.is_terminal());
        assert!(!BroadcastStatus::Active.is_terminal());
        assert!(!BroadcastStatus::Reconnecting.is_terminal());
    }

    #[tokio::test]
    async fn test_memory_store_records_transitions_in_order() {
        let store = MemoryStatusStore::new();

        store
            .update_status("b1", BroadcastStatus::Active, None)
            .await
            .unwrap();
        store
            .update_status("b1", BroadcastStatus::Reconnecting, Some("attempt 1 of 4".into()))
            .await
            .unwrap();
        store
            .update_status("b1", BroadcastStatus::Failed, Some("gave up".into()))
            .await
            .unwrap();

        let record = store.record("b1").await.unwrap();
        assert_eq!(record.status, Some(BroadcastStatus::Failed));
        assert_eq!(record.error_message.as_deref(), Some("gave up"));
        assert_eq!(
            record.history,
            vec![
                BroadcastStatus::Active,
                BroadcastStatus::Reconnecting,
                BroadcastStatus::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn test_started_at_is_stamped_once() {
        let store = MemoryStatusStore::new();

        store.set_started_at("b1").await.unwrap();
        let first = store.record("b1").await.unwrap().started_at.unwrap();

        store.set_started_at("b1").await.unwrap();
        let second = store.record("b1").await.unwrap().started_at.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_broadcast_has_no_record() {
        let store = MemoryStatusStore::new();
        assert!(store.record("missing").await.is_none());
    }
}
