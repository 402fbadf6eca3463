// orchestrator-service-rs/src/remote.rs
// Remote command channel: the source trait, the result document and an
// in-process channel implementation

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_types::RequestRecord;
use tokio::sync::mpsc;

use crate::correlator::ResultSink;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote transport error: {0}")]
    Transport(String),

    #[error("remote store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed remote payload: {0}")]
    Payload(String),

    #[error("remote channel closed")]
    Closed,
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Payload(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

/// A pending command addressed to some device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    /// Storage key of the entry; claim and completion writes go here.
    pub key: String,
    /// Correlation id, the entry's `id` field or else its key.
    pub id: String,
    pub device_id: String,
    pub command: String,
}

impl RemoteCommand {
    pub fn new(id: impl Into<String>, device_id: impl Into<String>, command: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            key: id.clone(),
            id,
            device_id: device_id.into(),
            command: command.into(),
        }
    }
}

/// Feed of pending remote commands.
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// Wait for the next pending command. `Ok(None)` means the source is
    /// exhausted and the listener should stop.
    async fn next(&self) -> Result<Option<RemoteCommand>, RemoteError>;

    /// Mark a command as taken (`status=processing`) before it is dispatched.
    async fn claim(&self, command: &RemoteCommand) -> Result<(), RemoteError>;

    /// Close out a claimed command that was refused before it ran, so the
    /// entry does not stay `processing`.
    async fn reject(&self, command: &RemoteCommand, reason: &str) -> Result<(), RemoteError>;
}

/// The document written back for a completed remote request.
pub fn result_document(record: &RequestRecord, device_id: &str) -> Value {
    json!({
        "command_id": record.request_id,
        "device_id": device_id,
        "status": "completed",
        "completed_at": record.completed_at.unwrap_or_else(Utc::now),
        "outcome": record.outcome.status_label(),
        "success": record.succeeded(),
        "execution_success": record.execution_success,
        "output": record.output,
        "code_info": record.descriptor.as_ref().map_or_else(|| json!({}), |d| json!(d)),
        "metrics": record.metrics.as_ref().map_or_else(|| json!({}), |m| json!(m)),
        "analysis": record.analysis.as_ref().map_or_else(|| json!({}), |a| json!(a)),
        "error": record.error,
    })
}

/// The document written back for a command refused before dispatch.
pub fn rejection_document(command: &RemoteCommand, device_id: &str, reason: &str) -> Value {
    json!({
        "command_id": command.id,
        "device_id": device_id,
        "status": "rejected",
        "completed_at": Utc::now(),
        "success": false,
        "error": reason,
    })
}

/// In-process command source backed by tokio channels. Finished records are
/// sent back on the results channel.
pub struct ChannelCommandSource {
    commands: tokio::sync::Mutex<mpsc::Receiver<RemoteCommand>>,
    results: mpsc::UnboundedSender<RequestRecord>,
    claimed: Mutex<Vec<String>>,
    rejected: Mutex<Vec<(String, String)>>,
}

impl ChannelCommandSource {
    /// Returns the source, the sender used to push commands and the
    /// receiver that gets every delivered record.
    pub fn new(
        buffer: usize,
    ) -> (
        Self,
        mpsc::Sender<RemoteCommand>,
        mpsc::UnboundedReceiver<RequestRecord>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(buffer.max(1));
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let source = Self {
            commands: tokio::sync::Mutex::new(command_rx),
            results: result_tx,
            claimed: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
        };
        (source, command_tx, result_rx)
    }

    /// Ids claimed so far, in claim order.
    pub fn claimed(&self) -> Vec<String> {
        self.claimed.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// `(id, reason)` for every command refused after its claim.
    pub fn rejected(&self) -> Vec<(String, String)> {
        self.rejected.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CommandSource for ChannelCommandSource {
    async fn next(&self) -> Result<Option<RemoteCommand>, RemoteError> {
        Ok(self.commands.lock().await.recv().await)
    }

    async fn claim(&self, command: &RemoteCommand) -> Result<(), RemoteError> {
        self.claimed
            .lock()
            .map_err(|_| RemoteError::Transport("claim log poisoned".into()))?
            .push(command.id.clone());
        Ok(())
    }

    async fn reject(&self, command: &RemoteCommand, reason: &str) -> Result<(), RemoteError> {
        self.rejected
            .lock()
            .map_err(|_| RemoteError::Transport("rejection log poisoned".into()))?
            .push((command.id.clone(), reason.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ResultSink for ChannelCommandSource {
    async fn deliver(&self, record: &RequestRecord) -> Result<(), RemoteError> {
        self.results
            .send(record.clone())
            .map_err(|_| RemoteError::Closed)
    }
}
