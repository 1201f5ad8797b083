//! HTTP worker that runs on the bootstrapped remote host. Binds a loopback
//! port, prints the `DAEMON_STARTED` line the bootstrapper waits for, then
//! serves `/health`, `/exec`, `/file/read`, `/file/write`, `/shutdown` until
//! told to stop or until `idle_timeout_secs` passes without a request.
//!
//! Invoked as `agent-remote-worker <port> <token> <idle_timeout_secs>`, where
//! `port` 0 means "bind an ephemeral port".

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::process::Command;

struct AppState {
    token: String,
    started_at: Instant,
    last_activity_unix_ms: AtomicI64,
    shutting_down: AtomicBool,
}

fn now_unix_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

fn touch(state: &AppState) {
    state.last_activity_unix_ms.store(now_unix_ms(), Ordering::SeqCst);
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", state.token))
        .unwrap_or(false)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    pid: u32,
    uptime: u64,
}

async fn health(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<HealthResponse>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    touch(&state);
    Ok(Json(HealthResponse { status: "ok", pid: std::process::id(), uptime: state.started_at.elapsed().as_secs() }))
}

#[derive(Deserialize)]
struct ExecRequest {
    command: String,
    cwd: Option<String>,
    env: Option<HashMap<String, String>>,
    #[serde(rename = "timeout")]
    timeout_ms: Option<u64>,
}

#[derive(Serialize)]
struct ExecResponse {
    stdout: String,
    stderr: String,
    #[serde(rename = "exitCode")]
    exit_code: i32,
}

async fn exec(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(req): Json<ExecRequest>) -> Result<Json<ExecResponse>, (StatusCode, Json<serde_json::Value>)> {
    require_auth(&state, &headers)?;
    touch(&state);

    let mut command = Command::new("sh");
    command.arg("-c").arg(&req.command).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(cwd) = &req.cwd {
        command.current_dir(cwd);
    }
    if let Some(env) = &req.env {
        for (k, v) in env {
            command.env(k, v);
        }
    }

    let timeout = Duration::from_millis(req.timeout_ms.unwrap_or(30_000));
    let run = async {
        let child = command.spawn().map_err(|e| e.to_string())?;
        child.wait_with_output().await.map_err(|e| e.to_string())
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(output)) => Ok(Json(ExecResponse {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })),
        Ok(Err(e)) => Err((StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": e})))),
        Err(_) => Err((StatusCode::GATEWAY_TIMEOUT, Json(serde_json::json!({"error": "command timed out"})))),
    }
}

#[derive(Deserialize)]
struct FileReadRequest {
    path: String,
}

#[derive(Serialize)]
struct FileReadResponse {
    content: String,
}

async fn file_read(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(req): Json<FileReadRequest>) -> Result<Json<FileReadResponse>, (StatusCode, Json<serde_json::Value>)> {
    require_auth(&state, &headers)?;
    touch(&state);
    match tokio::fs::read_to_string(&req.path).await {
        Ok(content) => Ok(Json(FileReadResponse { content })),
        Err(e) => Err((StatusCode::NOT_FOUND, Json(serde_json::json!({"error": e.to_string()})))),
    }
}

#[derive(Deserialize)]
struct FileWriteRequest {
    path: String,
    content: String,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

async fn file_write(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(req): Json<FileWriteRequest>) -> Result<Json<SuccessResponse>, (StatusCode, Json<serde_json::Value>)> {
    require_auth(&state, &headers)?;
    touch(&state);
    match tokio::fs::write(&req.path, req.content).await {
        Ok(()) => Ok(Json(SuccessResponse { success: true })),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": e.to_string()})))),
    }
}

#[derive(Serialize)]
struct ShutdownResponse {
    message: &'static str,
}

async fn shutdown(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<ShutdownResponse>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    state.shutting_down.store(true, Ordering::SeqCst);
    Ok(Json(ShutdownResponse { message: "shutting down" }))
}

fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    if authorized(state, headers) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "unauthorized"}))))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))).init();

    let mut args = std::env::args().skip(1);
    let requested_port: u16 = args.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let token = args.next().unwrap_or_default();
    let idle_timeout_secs: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(1800);

    let state = Arc::new(AppState {
        token,
        started_at: Instant::now(),
        last_activity_unix_ms: AtomicI64::new(now_unix_ms()),
        shutting_down: AtomicBool::new(false),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/exec", post(exec))
        .route("/file/read", post(file_read))
        .route("/file/write", post(file_write))
        .route("/shutdown", post(shutdown))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", requested_port)).await.expect("bind");
    let bound_port = listener.local_addr().expect("local_addr").port();

    println!("DAEMON_STARTED:{}", serde_json::json!({"port": bound_port, "token": state.token, "pid": std::process::id()}));
    use std::io::Write;
    let _ = std::io::stdout().flush();
    tracing::info!(port = bound_port, pid = std::process::id(), "remote worker listening");

    let watchdog_state = state.clone();
    let idle_timeout = Duration::from_secs(idle_timeout_secs);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            if watchdog_state.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let idle_ms = now_unix_ms() - watchdog_state.last_activity_unix_ms.load(Ordering::SeqCst);
            if idle_timeout_secs > 0 && idle_ms as u64 >= idle_timeout.as_millis() as u64 {
                tracing::info!(idle_timeout_secs, "idle timeout reached, shutting down");
                watchdog_state.shutting_down.store(true, Ordering::SeqCst);
                return;
            }
        }
    });

    let shutdown_state = state.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if shutdown_state.shutting_down.load(Ordering::SeqCst) {
                return;
            }
        }
    });

    let _ = server.await;
}
