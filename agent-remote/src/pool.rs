//! Connection pool: one entry per remote host, idempotent `connect`, and an
//! HTTP channel to the remote worker's `/exec` and `/file/*` endpoints.

use crate::bootstrap::{bootstrap, BootstrapConfig, BootstrapError, DaemonInfo, HostDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Bootstrapping,
    Ready,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("{0}")]
    Http(String),
    #[error("{0}")]
    Remote(String),
}

/// Every error surfaced to an end user is prefixed with `[<host>]` so local
/// and remote failures are never confused.
fn tag(host: &str, msg: impl std::fmt::Display) -> String {
    format!("[{host}] {msg}")
}

struct PoolEntry {
    info: DaemonInfo,
    http: reqwest::Client,
    state: ConnectionState,
}

pub struct RemotePool {
    entries: Mutex<HashMap<String, Arc<Mutex<PoolEntry>>>>,
}

impl Default for RemotePool {
    fn default() -> Self {
        Self::new()
    }
}

impl RemotePool {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Idempotent: a second `connect` for the same `host.connection_id()`
    /// returns the already-`Ready` entry without re-bootstrapping. Concurrent
    /// connects for the same id serialize on that id's entry lock rather than
    /// racing two bootstraps.
    pub async fn connect(&self, host: &HostDescriptor, config: &BootstrapConfig) -> Result<(), RemoteError> {
        let id = host.connection_id();
        let slot = {
            let mut entries = self.entries.lock().await;
            entries.entry(id.clone()).or_insert_with(|| Arc::new(Mutex::new(PoolEntry::placeholder()))).clone()
        };

        let mut entry = slot.lock().await;
        if entry.state == ConnectionState::Ready {
            return Ok(());
        }
        entry.state = ConnectionState::Bootstrapping;

        let info = bootstrap(host, config).await?;
        let http = build_http_client(&info.token)?;
        verify_health(&http, &info).await.map_err(|e| RemoteError::Remote(tag(&host.hostname, e)))?;

        tracing::info!(host = %host.hostname, port = info.port, "remote connection ready");
        entry.info = info;
        entry.http = http;
        entry.state = ConnectionState::Ready;
        Ok(())
    }

    pub async fn disconnect(&self, connection_id: &str) {
        let entry = { self.entries.lock().await.remove(connection_id) };
        if let Some(entry) = entry {
            let entry = entry.lock().await;
            tracing::info!(connection_id, "disconnecting remote worker");
            let url = format!("http://{}:{}/shutdown", entry.info.host, entry.info.port);
            let _ = entry.http.post(url).send().await;
        }
    }

    pub async fn execute(
        &self,
        connection_id: &str,
        command: &str,
        cwd: Option<&str>,
        env: Option<&HashMap<String, String>>,
        timeout: Option<Duration>,
        cancel: &agent_core::CancelToken,
    ) -> Result<ExecResult, RemoteError> {
        let entry = self.ready_entry(connection_id).await?;
        let entry = entry.lock().await;
        let url = format!("http://{}:{}/exec", entry.info.host, entry.info.port);
        let body = ExecRequest { command: command.to_string(), cwd: cwd.map(|s| s.to_string()), env: env.cloned(), timeout_ms: timeout.map(|d| d.as_millis() as u64) };
        let request = entry.http.post(url).json(&body).send();

        let resp = tokio::select! {
            result = request => result.map_err(|e| RemoteError::Http(tag(&entry.info.host, e)))?,
            _ = cancel.cancelled() => return Err(RemoteError::Remote(tag(&entry.info.host, "execution cancelled"))),
        };
        parse_response(&entry.info.host, resp).await
    }

    pub async fn read_file(&self, connection_id: &str, path: &str) -> Result<String, RemoteError> {
        let entry = self.ready_entry(connection_id).await?;
        let entry = entry.lock().await;
        let url = format!("http://{}:{}/file/read", entry.info.host, entry.info.port);
        let resp = entry.http.post(url).json(&serde_json::json!({"path": path})).send().await.map_err(|e| RemoteError::Http(tag(&entry.info.host, e)))?;
        let value: FileReadResponse = parse_response(&entry.info.host, resp).await?;
        value.content.ok_or_else(|| RemoteError::Remote(tag(&entry.info.host, "missing content in response")))
    }

    pub async fn write_file(&self, connection_id: &str, path: &str, content: &str) -> Result<(), RemoteError> {
        let entry = self.ready_entry(connection_id).await?;
        let entry = entry.lock().await;
        let url = format!("http://{}:{}/file/write", entry.info.host, entry.info.port);
        let resp = entry
            .http
            .post(url)
            .json(&serde_json::json!({"path": path, "content": content}))
            .send()
            .await
            .map_err(|e| RemoteError::Http(tag(&entry.info.host, e)))?;
        let _: WriteResponse = parse_response(&entry.info.host, resp).await?;
        Ok(())
    }

    async fn ready_entry(&self, connection_id: &str) -> Result<Arc<Mutex<PoolEntry>>, RemoteError> {
        let entries = self.entries.lock().await;
        let slot = entries.get(connection_id).cloned().ok_or_else(|| RemoteError::Remote(format!("no connection for id {connection_id}")))?;
        drop(entries);
        if slot.lock().await.state != ConnectionState::Ready {
            return Err(RemoteError::Remote(format!("connection {connection_id} is not ready")));
        }
        Ok(slot)
    }
}

impl PoolEntry {
    fn placeholder() -> Self {
        Self {
            info: DaemonInfo { host: String::new(), port: 0, token: String::new(), pid: 0 },
            http: reqwest::Client::new(),
            state: ConnectionState::Connecting,
        }
    }
}

fn build_http_client(token: &str) -> Result<reqwest::Client, RemoteError> {
    let mut headers = reqwest::header::HeaderMap::new();
    let mut value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| RemoteError::Http(e.to_string()))?;
    value.set_sensitive(true);
    headers.insert(reqwest::header::AUTHORIZATION, value);
    reqwest::Client::builder().default_headers(headers).build().map_err(|e| RemoteError::Http(e.to_string()))
}

async fn verify_health(http: &reqwest::Client, info: &DaemonInfo) -> Result<(), String> {
    let url = format!("http://{}:{}/health", info.host, info.port);
    let resp = http.get(url).send().await.map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("health check returned {}", resp.status()));
    }
    Ok(())
}

#[derive(Serialize)]
struct ExecRequest {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "timeout")]
    timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

#[derive(Deserialize)]
struct FileReadResponse {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WriteResponse {
    #[serde(default)]
    #[allow(dead_code)]
    success: bool,
}

async fn parse_response<T: for<'de> Deserialize<'de>>(host: &str, resp: reqwest::Response) -> Result<T, RemoteError> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(|e| RemoteError::Http(tag(host, e)))?;
    if !status.is_success() {
        let msg = body.get("error").and_then(|v| v.as_str()).unwrap_or("remote request failed").to_string();
        return Err(RemoteError::Remote(tag(host, msg)));
    }
    serde_json::from_value(body).map_err(|e| RemoteError::Remote(tag(host, e)))
}
