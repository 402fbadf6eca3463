// orchestrator-service-rs/src/status.rs
// Device status snapshots and the channel they are published on

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::remote::RemoteError;

/// Labels written to the status channel outside the per-request lifecycle.
pub mod labels {
    pub const READY: &str = "ready";
    pub const PROCESSING: &str = "processing";
    pub const CONFIG_CHANGED: &str = "config_changed";
    pub const OFFLINE: &str = "offline";
    pub const ERROR: &str = "error";
}

/// One status write. Fields in `extra` are merged into the top level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub uptime_seconds: f64,
    pub safety_mode: bool,
    pub timeout_seconds: u64,
    pub total_commands: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("status channel unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, snapshot: &StatusSnapshot) -> Result<(), StatusError>;
}

/// Discards every snapshot. Used when no remote store is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatusSink;

#[async_trait]
impl StatusSink for NullStatusSink {
    async fn publish(&self, _snapshot: &StatusSnapshot) -> Result<(), StatusError> {
        Ok(())
    }
}

/// Keeps every snapshot in memory, in publish order.
#[derive(Debug, Default)]
pub struct MemoryStatusSink {
    snapshots: Mutex<Vec<StatusSnapshot>>,
}

impl MemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<StatusSnapshot> {
        self.snapshots
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.snapshots().into_iter().map(|s| s.status).collect()
    }
}

#[async_trait]
impl StatusSink for MemoryStatusSink {
    async fn publish(&self, snapshot: &StatusSnapshot) -> Result<(), StatusError> {
        self.snapshots
            .lock()
            .map_err(|_| StatusError::Unavailable("status buffer poisoned".into()))?
            .push(snapshot.clone());
        Ok(())
    }
}
