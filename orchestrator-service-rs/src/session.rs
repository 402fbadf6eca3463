// orchestrator-service-rs/src/session.rs
// Per-process session state: settings, command history and the session log

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use shared_types::{Origin, RequestRecord};

use crate::status::StatusSnapshot;

/// A request that reached execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub origin: Origin,
    pub request: String,
    pub code: String,
    pub execution_success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub device_id: String,
    pub duration_seconds: u64,
    pub total_commands: usize,
    pub successful_executions: usize,
    pub success_rate: f64,
    pub unique_commands: usize,
    pub safety_mode: bool,
    pub timeout_seconds: u64,
}

#[derive(Debug)]
struct SessionState {
    safety_mode: bool,
    timeout_seconds: u64,
    command_history: Vec<CommandHistoryEntry>,
    log: Vec<RequestRecord>,
}

/// Owns every mutable counter of a running instance. Shared between the
/// local REPL and the remote listener behind an `Arc`.
#[derive(Debug)]
pub struct Session {
    device_id: String,
    session_id: String,
    started_at: DateTime<Utc>,
    clock: Instant,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(device_id: impl Into<String>, safety_mode: bool, timeout_seconds: u64) -> Self {
        Self {
            device_id: device_id.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            clock: Instant::now(),
            state: Mutex::new(SessionState {
                safety_mode,
                timeout_seconds: timeout_seconds.max(1),
                command_history: Vec::new(),
                log: Vec::new(),
            }),
        }
    }

    // Counters stay usable even if a holder panicked mid-update.
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.clock.elapsed().as_secs_f64()
    }

    pub fn safety_mode(&self) -> bool {
        self.state().safety_mode
    }

    pub fn set_safety_mode(&self, enabled: bool) {
        self.state().safety_mode = enabled;
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.state().timeout_seconds
    }

    /// Zero is rejected; a command always gets at least one second.
    pub fn set_timeout_seconds(&self, seconds: u64) -> bool {
        if seconds == 0 {
            return false;
        }
        self.state().timeout_seconds = seconds;
        true
    }

    pub fn total_commands(&self) -> usize {
        self.state().command_history.len()
    }

    pub fn record_command(&self, entry: CommandHistoryEntry) {
        self.state().command_history.push(entry);
    }

    pub fn command_history(&self) -> Vec<CommandHistoryEntry> {
        self.state().command_history.clone()
    }

    /// The last `n` executed commands, oldest first.
    pub fn recent_commands(&self, n: usize) -> Vec<CommandHistoryEntry> {
        let state = self.state();
        let skip = state.command_history.len().saturating_sub(n);
        state.command_history[skip..].to_vec()
    }

    pub fn log_record(&self, record: RequestRecord) {
        self.state().log.push(record);
    }

    pub fn session_log(&self) -> Vec<RequestRecord> {
        self.state().log.clone()
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.state();
        let total_commands = state.command_history.len();
        let successful_executions = state
            .command_history
            .iter()
            .filter(|c| c.execution_success)
            .count();
        let unique_commands = state
            .command_history
            .iter()
            .map(|c| c.request.as_str())
            .collect::<HashSet<_>>()
            .len();
        let success_rate = if total_commands == 0 {
            0.0
        } else {
            successful_executions as f64 / total_commands as f64 * 100.0
        };
        SessionStats {
            device_id: self.device_id.clone(),
            duration_seconds: self.clock.elapsed().as_secs(),
            total_commands,
            successful_executions,
            success_rate,
            unique_commands,
            safety_mode: state.safety_mode,
            timeout_seconds: state.timeout_seconds,
        }
    }

    /// Build a status snapshot for `status` with extra fields merged in.
    pub fn snapshot(&self, status: &str, extra: Map<String, Value>) -> StatusSnapshot {
        let state = self.state();
        StatusSnapshot {
            device_id: self.device_id.clone(),
            timestamp: Utc::now(),
            status: status.to_string(),
            uptime_seconds: self.clock.elapsed().as_secs_f64(),
            safety_mode: state.safety_mode,
            timeout_seconds: state.timeout_seconds,
            total_commands: state.command_history.len(),
            extra,
        }
    }

    /// Everything `export` writes: device info, session info, statistics,
    /// command history and the detailed log.
    pub fn export_document(&self, model: &str, remote_connected: bool, listener_active: bool) -> Value {
        let stats = self.stats();
        let now = Utc::now();
        let state = self.state();
        let commands: Vec<&str> = state
            .command_history
            .iter()
            .map(|c| c.request.as_str())
            .collect();
        json!({
            "device_info": {
                "device_id": self.device_id,
                "remote_connected": remote_connected,
                "listener_active": listener_active,
            },
            "session_info": {
                "session_id": self.session_id,
                "start_time": self.started_at,
                "end_time": now,
                "duration_seconds": stats.duration_seconds,
                "model_used": model,
                "safety_mode": stats.safety_mode,
                "timeout_seconds": stats.timeout_seconds,
            },
            "statistics": {
                "total_commands": stats.total_commands,
                "successful_executions": stats.successful_executions,
                "unique_commands": stats.unique_commands,
            },
            "command_history": commands,
            "detailed_log": state.log,
        })
    }

    /// Write the export document to `dir/session_<device>_<timestamp>.json`.
    pub fn export_to(
        &self,
        dir: &Path,
        model: &str,
        remote_connected: bool,
        listener_active: bool,
    ) -> std::io::Result<PathBuf> {
        let document = self.export_document(model, remote_connected, listener_active);
        let filename = format!(
            "session_{}_{}.json",
            self.device_id,
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        let path = dir.join(filename);
        let body = serde_json::to_string_pretty(&document)?;
        fs::write(&path, body)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(request: &str, success: bool) -> CommandHistoryEntry {
        CommandHistoryEntry {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            origin: Origin::Local,
            request: request.into(),
            code: "true".into(),
            execution_success: success,
        }
    }

    #[test]
    fn stats_count_successes_and_unique_requests() {
        let session = Session::new("dev00001", true, 60);
        session.record_command(entry("list files", true));
        session.record_command(entry("list files", false));
        session.record_command(entry("uptime", true));

        let stats = session.stats();
        assert_eq!(stats.total_commands, 3);
        assert_eq!(stats.successful_executions, 2);
        assert_eq!(stats.unique_commands, 2);
        assert!((stats.success_rate - 66.666).abs() < 0.1);
    }

    #[test]
    fn timeout_must_be_positive() {
        let session = Session::new("dev00001", true, 60);
        assert!(!session.set_timeout_seconds(0));
        assert_eq!(session.timeout_seconds(), 60);
        assert!(session.set_timeout_seconds(5));
        assert_eq!(session.timeout_seconds(), 5);
    }

    #[test]
    fn recent_commands_keeps_the_tail() {
        let session = Session::new("dev00001", true, 60);
        for i in 0..12 {
            session.record_command(entry(&format!("cmd {i}"), true));
        }
        let recent = session.recent_commands(10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].request, "cmd 2");
        assert_eq!(recent[9].request, "cmd 11");
    }

    #[test]
    fn snapshot_reflects_current_settings() {
        let session = Session::new("dev00001", true, 60);
        session.set_safety_mode(false);
        session.record_command(entry("uptime", true));
        let snapshot = session.snapshot("ready", Map::new());
        assert_eq!(snapshot.device_id, "dev00001");
        assert!(!snapshot.safety_mode);
        assert_eq!(snapshot.total_commands, 1);
    }

    #[test]
    fn export_writes_a_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new("dev00001", true, 30);
        session.record_command(entry("uptime", true));

        let path = session.export_to(dir.path(), "test-model", false, false).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("session_dev00001_"));

        let document: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(document["statistics"]["total_commands"], 1);
        assert_eq!(document["session_info"]["model_used"], "test-model");
        assert_eq!(document["command_history"][0], "uptime");
    }
}
