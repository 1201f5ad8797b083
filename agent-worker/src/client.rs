//! A single framed connection to the worker, with a background reader task
//! that resolves pending callers by correlation id so requests can be
//! in-flight concurrently on one socket.

use crate::ipc::{read_frame, write_frame, FramingError, Request, Response};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("request timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("worker error: {0}")]
    Worker(String),
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>;

/// A framed payload plus the channel the writer task uses to report whether
/// the write made it onto the wire.
type WriteJob = (Vec<u8>, oneshot::Sender<Result<(), FramingError>>);

/// One framed connection. Cloning shares the same underlying socket, writer
/// task, and pending-request table.
#[derive(Clone)]
pub struct Client {
    writer_tx: mpsc::UnboundedSender<WriteJob>,
    pending: PendingMap,
    timeout: Duration,
}

/// Unifies `UnixStream` and `TcpStream` behind one boxable type.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

impl Client {
    /// Wraps an already-connected stream, spawning the background reader and
    /// a single writer task that owns the write half exclusively. Every
    /// `request()` hands its frame to the writer task over a channel instead
    /// of touching the socket directly, so concurrent requests never race
    /// each other for the write half.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: Box<dyn AsyncReadWrite> = Box::new(stream);
        let (read_half, write_half): (ReadHalf<Box<dyn AsyncReadWrite>>, WriteHalf<Box<dyn AsyncReadWrite>>) =
            tokio::io::split(boxed);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            run_reader(read_half, reader_pending).await;
        });

        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<WriteJob>();
        tokio::spawn(async move {
            run_writer(write_half, writer_rx).await;
        });

        Self { writer_tx, pending, timeout: DEFAULT_REQUEST_TIMEOUT }
    }

    #[cfg(unix)]
    pub async fn try_connect_unix(socket_path: impl AsRef<std::path::Path>) -> Option<Self> {
        let stream = tokio::net::UnixStream::connect(socket_path).await.ok()?;
        Some(Self::from_stream(stream))
    }

    pub async fn try_connect_tcp(port: u16) -> Option<Self> {
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.ok()?;
        Some(Self::from_stream(stream))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends one request and awaits its matching response, bounded by the
    /// client's configured timeout (30s by default, per the IPC contract).
    pub async fn request(&self, kind: impl Into<String>, payload: Option<serde_json::Value>) -> Result<serde_json::Value, ClientError> {
        let req = Request::new(kind, payload);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(req.id.clone(), tx);

        let bytes = serde_json::to_vec(&req).map_err(|e| ClientError::Worker(e.to_string()))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.writer_tx.send((bytes, ack_tx)).is_err() {
            self.pending.lock().unwrap().remove(&req.id);
            return Err(ClientError::Closed);
        }
        if let Err(e) = ack_rx.await.map_err(|_| ClientError::Closed)? {
            self.pending.lock().unwrap().remove(&req.id);
            return Err(e.into());
        }

        let response = tokio::time::timeout(self.timeout, rx).await.map_err(|_| ClientError::Timeout)?.map_err(|_| ClientError::Closed)?;

        match response.error {
            Some(e) => Err(ClientError::Worker(e)),
            None => Ok(response.data.unwrap_or(serde_json::Value::Null)),
        }
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request("ping", None).await.map(|_| ())
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.request("shutdown", None).await.map(|_| ())
    }

    /// Polls `get_output` with an advancing cursor, invoking `on_chunk` for
    /// each new chunk, until the task reports `hasMore: false`.
    pub async fn stream_output(
        &self,
        task_id: &str,
        mut on_chunk: impl FnMut(serde_json::Value),
        poll_interval: Duration,
    ) -> Result<(), ClientError> {
        let mut from_id: Option<u64> = None;
        loop {
            let payload = serde_json::json!({"taskId": task_id, "fromId": from_id});
            let data = self.request("get_output", Some(payload)).await?;
            let chunks = data.get("chunks").and_then(|c| c.as_array()).cloned().unwrap_or_default();
            for chunk in &chunks {
                if let Some(pos) = chunk.get("position").and_then(|p| p.as_u64()) {
                    from_id = Some(pos + 1);
                }
                on_chunk(chunk.clone());
            }
            let has_more = data.get("hasMore").and_then(|v| v.as_bool()).unwrap_or(false);
            if !has_more {
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Owns the write half exclusively for the life of the connection, writing
/// one frame at a time in the order `request()` callers enqueued them.
async fn run_writer<W: AsyncWrite + Unpin>(mut writer: W, mut jobs: mpsc::UnboundedReceiver<WriteJob>) {
    while let Some((bytes, ack)) = jobs.recv().await {
        let result = write_frame(&mut writer, &bytes).await;
        let failed = result.is_err();
        let _ = ack.send(result);
        if failed {
            break;
        }
    }
}

async fn run_reader<R: AsyncRead + Unpin>(mut reader: R, pending: PendingMap) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "client reader framing error");
                break;
            }
        };
        let response: Response = match serde_json::from_slice(&frame) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "malformed response payload");
                continue;
            }
        };
        if let Some(tx) = pending.lock().unwrap().remove(&response.id) {
            let _ = tx.send(response);
        }
    }
    // Connection closed: fail every still-pending request rather than
    // leaving callers waiting out their full timeout.
    for (_, tx) in pending.lock().unwrap().drain() {
        let _ = tx.send(Response::err("", "connection closed"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use agent_core::ToolRegistry;
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn ping_roundtrips_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let server = StdArc::new(Server::open(dir.path().join("store.db"), StdArc::new(ToolRegistry::new())).unwrap());
        let server_task = server.clone();
        tokio::spawn(async move {
            let _ = server_task.serve_tcp(18732).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = Client::try_connect_tcp(18732).await.expect("connect");
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_request_type_surfaces_as_worker_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = StdArc::new(Server::open(dir.path().join("store.db"), StdArc::new(ToolRegistry::new())).unwrap());
        let server_task = server.clone();
        tokio::spawn(async move {
            let _ = server_task.serve_tcp(18733).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = Client::try_connect_tcp(18733).await.expect("connect");
        let err = client.request("nonsense", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Worker(_)));
    }

    #[tokio::test]
    async fn concurrent_requests_on_one_client_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let server = StdArc::new(Server::open(dir.path().join("store.db"), StdArc::new(ToolRegistry::new())).unwrap());
        let server_task = server.clone();
        tokio::spawn(async move {
            let _ = server_task.serve_tcp(18734).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = Client::try_connect_tcp(18734).await.expect("connect");
        let a = client.clone();
        let b = client.clone();
        let c = client.clone();
        let (r1, r2, r3) = tokio::join!(a.ping(), b.ping(), c.ping());
        assert!(r1.is_ok());
        assert!(r2.is_ok());
        assert!(r3.is_ok());
    }
}
