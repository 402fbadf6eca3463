// orchestrator-service-rs/src/realtime_db.rs
// REST adapter for a Firebase-style realtime JSON store

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use config_rs::RemoteSettings;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use shared_types::RequestRecord;
use tracing::{debug, info, warn};

use crate::correlator::ResultSink;
use crate::remote::{
    rejection_document, result_document, CommandSource, RemoteCommand, RemoteError,
};
use crate::status::{StatusError, StatusSink, StatusSnapshot};

/// Polls `{db}/{commands}.json` for this device's pending entries and writes
/// claims, results and status snapshots back with PATCH/PUT.
pub struct RealtimeDbRemote {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
    commands_path: String,
    results_path: String,
    devices_path: String,
    device_id: String,
    poll_interval: Duration,
    queue: tokio::sync::Mutex<VecDeque<RemoteCommand>>,
    // Entry key -> correlation id for claimed commands that have not been
    // written back yet. Keeps a claimed entry from being picked up twice.
    taken: Mutex<HashMap<String, String>>,
}

impl RealtimeDbRemote {
    pub fn from_settings(settings: &RemoteSettings, device_id: &str) -> Result<Self, RemoteError> {
        let base_url = settings
            .database_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| RemoteError::Transport("remote.database_url is not set".into()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        info!(database = %base_url, device_id, "realtime database adapter ready");

        Ok(Self {
            client,
            base_url,
            auth_token: settings.auth_token.clone(),
            commands_path: settings.commands_path.clone(),
            results_path: settings.results_path.clone(),
            devices_path: settings.devices_path.clone(),
            device_id: device_id.to_string(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            queue: tokio::sync::Mutex::new(VecDeque::new()),
            taken: Mutex::new(HashMap::new()),
        })
    }

    fn taken(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.taken.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn url(&self, path: &str) -> String {
        let mut url = format!("{}/{}.json", self.base_url, path.trim_matches('/'));
        if let Some(token) = &self.auth_token {
            url.push_str("?auth=");
            url.push_str(token);
        }
        url
    }

    async fn check(response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn patch(&self, path: &str, body: &Value) -> Result<(), RemoteError> {
        let response = self.client.patch(self.url(path)).json(body).send().await?;
        Self::check(response).await.map(|_| ())
    }

    async fn put(&self, path: &str, body: &Value) -> Result<(), RemoteError> {
        let response = self.client.put(self.url(path)).json(body).send().await?;
        Self::check(response).await.map(|_| ())
    }

    /// One round trip to the store; used by the CLI `remote` command.
    pub async fn ping(&self) -> Result<(), RemoteError> {
        let path = format!("{}/{}", self.devices_path, self.device_id);
        let response = self.client.get(self.url(&path)).send().await?;
        Self::check(response).await.map(|_| ())
    }

    /// Fetch every pending entry for this device that has not been handed
    /// out yet, ordered by key.
    pub async fn fetch_pending(&self) -> Result<Vec<RemoteCommand>, RemoteError> {
        let response = self
            .client
            .get(self.url(&self.commands_path))
            .send()
            .await?;
        let entries: Option<HashMap<String, Value>> = Self::check(response).await?.json().await?;

        let taken = self.taken();
        let mut pending = select_pending(entries.unwrap_or_default(), &self.device_id);
        pending.retain(|c| !taken.contains_key(&c.key));
        Ok(pending)
    }
}

/// Pick the entries addressed to `device_id` whose status is `pending`.
pub(crate) fn select_pending(entries: HashMap<String, Value>, device_id: &str) -> Vec<RemoteCommand> {
    let mut pending: Vec<RemoteCommand> = entries
        .into_iter()
        .filter_map(|(key, entry)| {
            if entry.get("device_id").and_then(Value::as_str) != Some(device_id)
                || entry.get("status").and_then(Value::as_str) != Some("pending")
            {
                return None;
            }
            let command = entry.get("command").and_then(Value::as_str)?.to_string();
            let id = entry
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| key.clone());
            Some(RemoteCommand {
                key,
                id,
                device_id: device_id.to_string(),
                command,
            })
        })
        .collect();
    pending.sort_by(|a, b| a.key.cmp(&b.key));
    pending
}

#[async_trait]
impl CommandSource for RealtimeDbRemote {
    async fn next(&self) -> Result<Option<RemoteCommand>, RemoteError> {
        let mut queue = self.queue.lock().await;
        loop {
            if let Some(command) = queue.pop_front() {
                return Ok(Some(command));
            }
            let pending = self.fetch_pending().await?;
            if pending.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            } else {
                debug!(count = pending.len(), "pending remote commands found");
                queue.extend(pending);
            }
        }
    }

    async fn claim(&self, command: &RemoteCommand) -> Result<(), RemoteError> {
        let path = format!("{}/{}", self.commands_path, command.key);
        self.patch(
            &path,
            &json!({
                "status": "processing",
                "processed_at": Utc::now(),
            }),
        )
        .await?;
        // Only a successful claim hides the entry from later polls; a failed
        // one is still pending and is picked up again.
        self.taken().insert(command.key.clone(), command.id.clone());
        Ok(())
    }

    async fn reject(&self, command: &RemoteCommand, reason: &str) -> Result<(), RemoteError> {
        let document = rejection_document(command, &self.device_id, reason);
        self.patch(&format!("{}/{}", self.commands_path, command.key), &document)
            .await?;
        self.taken().remove(&command.key);
        info!(command_id = %command.id, key = %command.key, "refused remote command closed");
        Ok(())
    }
}

#[async_trait]
impl ResultSink for RealtimeDbRemote {
    async fn deliver(&self, record: &RequestRecord) -> Result<(), RemoteError> {
        let document = result_document(record, &self.device_id);
        // Entry key and correlation id only differ when the entry carried its own id.
        let key = self
            .taken()
            .iter()
            .find(|(_, id)| **id == record.request_id)
            .map(|(key, _)| key.clone())
            .unwrap_or_else(|| record.request_id.clone());

        self.patch(&format!("{}/{}", self.commands_path, key), &document)
            .await?;
        self.put(
            &format!("{}/{}", self.results_path, record.request_id),
            &document,
        )
        .await?;
        self.taken().remove(&key);
        info!(request_id = %record.request_id, "result delivered to remote store");
        Ok(())
    }
}

#[async_trait]
impl StatusSink for RealtimeDbRemote {
    async fn publish(&self, snapshot: &StatusSnapshot) -> Result<(), StatusError> {
        let body = serde_json::to_value(snapshot)
            .map_err(|e| StatusError::Unavailable(e.to_string()))?;
        let path = format!("{}/{}", self.devices_path, self.device_id);
        if let Err(err) = self.patch(&path, &body).await {
            warn!(error = %err, status = %snapshot.status, "status publish failed");
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::Origin;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-request-per-connection HTTP store. GET lists a single pending
    /// entry `k1`; every other method answers `write_status`.
    async fn stub_store(write_status: u16) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let log = log.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    let head_end = loop {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                    let body_len = head
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    while buf.len() < head_end + body_len {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }

                    let request_line = head.lines().next().unwrap_or_default().to_string();
                    log.lock().unwrap().push(request_line.clone());
                    let (status, body) = if request_line.starts_with("GET") {
                        (
                            200,
                            r#"{"k1":{"device_id":"dev1","status":"pending","command":"uptime"}}"#,
                        )
                    } else {
                        (write_status, "{}")
                    };
                    let response = format!(
                        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        (format!("http://{}", addr), requests)
    }

    fn remote_at(url: &str) -> RealtimeDbRemote {
        let settings = RemoteSettings {
            enabled: true,
            database_url: Some(url.to_string()),
            poll_interval_ms: 10,
            ..RemoteSettings::default()
        };
        RealtimeDbRemote::from_settings(&settings, "dev1").unwrap()
    }

    fn settings(token: Option<&str>) -> RemoteSettings {
        RemoteSettings {
            enabled: true,
            database_url: Some("https://example-db.local/".into()),
            auth_token: token.map(str::to_string),
            ..RemoteSettings::default()
        }
    }

    #[test]
    fn urls_carry_the_auth_token() {
        let remote = RealtimeDbRemote::from_settings(&settings(Some("tok")), "dev1").unwrap();
        assert_eq!(
            remote.url("commands/abc"),
            "https://example-db.local/commands/abc.json?auth=tok"
        );
        let remote = RealtimeDbRemote::from_settings(&settings(None), "dev1").unwrap();
        assert_eq!(remote.url("/results/"), "https://example-db.local/results.json");
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let mut settings = settings(None);
        settings.database_url = None;
        assert!(RealtimeDbRemote::from_settings(&settings, "dev1").is_err());
    }

    #[tokio::test]
    async fn failed_claim_leaves_the_entry_pending() {
        let (url, _requests) = stub_store(503).await;
        let remote = remote_at(&url);

        let command = remote.next().await.unwrap().unwrap();
        assert_eq!(command.key, "k1");
        assert!(matches!(
            remote.claim(&command).await,
            Err(RemoteError::Status { status: 503, .. })
        ));

        let pending = remote.fetch_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, "k1");
    }

    #[tokio::test]
    async fn claimed_entry_is_hidden_until_delivered() {
        let (url, requests) = stub_store(200).await;
        let remote = remote_at(&url);

        let command = remote.next().await.unwrap().unwrap();
        remote.claim(&command).await.unwrap();
        assert!(remote.fetch_pending().await.unwrap().is_empty());

        let record = RequestRecord::new("k1", Origin::Remote, "uptime");
        remote.deliver(&record).await.unwrap();
        assert!(remote.taken().is_empty());

        let requests = requests.lock().unwrap().clone();
        assert!(requests.iter().any(|r| r.starts_with("PUT /results/k1.json")));
    }

    #[tokio::test]
    async fn rejected_entry_is_written_back_and_released() {
        let (url, requests) = stub_store(200).await;
        let remote = remote_at(&url);

        let command = remote.next().await.unwrap().unwrap();
        remote.claim(&command).await.unwrap();
        remote
            .reject(&command, "request id k1 has already been used")
            .await
            .unwrap();

        assert!(remote.taken().is_empty());
        let patches = requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.starts_with("PATCH /commands/k1.json"))
            .count();
        assert_eq!(patches, 2);
    }

    #[test]
    fn only_pending_entries_for_this_device_are_selected() {
        let entries: HashMap<String, Value> = serde_json::from_value(json!({
            "k2": {"device_id": "dev1", "status": "pending", "command": "uptime"},
            "k1": {"device_id": "dev1", "status": "pending", "command": "ls", "id": "cmd-1"},
            "k3": {"device_id": "dev1", "status": "processing", "command": "df"},
            "k4": {"device_id": "other", "status": "pending", "command": "whoami"},
            "k5": {"device_id": "dev1", "status": "pending"}
        }))
        .unwrap();

        let pending = select_pending(entries, "dev1");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].key, "k1");
        assert_eq!(pending[0].id, "cmd-1");
        assert_eq!(pending[1].id, "k2");
        assert_eq!(pending[1].command, "uptime");
    }
}
