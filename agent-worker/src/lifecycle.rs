//! Default path resolution, starting/stopping the `workerd` daemon as a
//! detached child process, and the PID/lock file that keeps two daemons
//! from ever owning the same socket at once.

use crate::client::Client;
use fs2::FileExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("another daemon already holds the lock at {0}")]
    LockHeld(PathBuf),
    #[error("daemon did not become reachable within {0:?}")]
    StartupTimeout(Duration),
    #[error("daemon did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Resolves the daemon's data directory: `$XDG_DATA_HOME/agent` or its
/// platform equivalent via the `dirs` crate.
pub fn data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(std::env::temp_dir).join("agent-worker")
}

pub fn socket_path() -> PathBuf {
    data_dir().join("worker.sock")
}

pub fn database_path() -> PathBuf {
    data_dir().join("store.db")
}

pub fn pid_lock_path() -> PathBuf {
    data_dir().join("worker.lock")
}

pub fn log_path() -> PathBuf {
    data_dir().join("worker.log")
}

/// Holds the exclusive advisory lock on `worker.lock` for the lifetime of
/// this daemon process. Dropping it releases the lock.
pub struct PidLock {
    file: std::fs::File,
    path: PathBuf,
}

impl PidLock {
    /// Acquires the lock, failing immediately (non-blocking) if another
    /// process already holds it — the daemon is expected to already be
    /// running in that case, not crashed.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LifecycleError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new().write(true).create(true).truncate(false).open(&path)?;
        file.try_lock_exclusive().map_err(|_| LifecycleError::LockHeld(path.clone()))?;
        file.set_len(0)?;
        let mut file = file;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { file, path })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
pub async fn is_running(socket: &Path) -> bool {
    Client::try_connect_unix(socket).await.is_some()
}

#[cfg(not(unix))]
pub async fn is_running(port: u16) -> bool {
    Client::try_connect_tcp(port).await.is_some()
}

/// Spawns `workerd` as a detached child process with stdio redirected to
/// `log_path`, then polls `try_connect` until it succeeds or `timeout`
/// elapses.
#[cfg(unix)]
pub async fn start_daemon(
    binary_path: &Path,
    socket: &Path,
    db_path: &Path,
    log_path: &Path,
    keep_alive: bool,
    timeout: Duration,
) -> Result<Client, LifecycleError> {
    use std::os::unix::process::CommandExt;
    use std::process::Stdio;

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;

    let mut command = std::process::Command::new(binary_path);
    command
        .arg("--socket")
        .arg(socket)
        .arg("--db")
        .arg(db_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file.try_clone()?))
        .stderr(Stdio::from(log_file));
    if keep_alive {
        command.arg("--keep-alive");
    }
    // Detach from the controlling terminal and the parent's process group so
    // the daemon survives the CLI invocation that spawned it exiting.
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    command.spawn()?;

    wait_for_reachable(socket, timeout).await
}

#[cfg(unix)]
async fn wait_for_reachable(socket: &Path, timeout: Duration) -> Result<Client, LifecycleError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(client) = Client::try_connect_unix(socket).await {
            return Ok(client);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(LifecycleError::StartupTimeout(timeout));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Sends `shutdown`, then polls for the socket to disappear; falls back to
/// a termination signal after a grace period if the daemon doesn't exit
/// cleanly on its own.
#[cfg(unix)]
pub async fn stop_daemon(socket: &Path) -> Result<(), LifecycleError> {
    if let Some(client) = Client::try_connect_unix(socket).await {
        let _ = client.shutdown().await;
    } else {
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + DEFAULT_SHUTDOWN_GRACE;
    while tokio::time::Instant::now() < deadline {
        if Client::try_connect_unix(socket).await.is_none() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(LifecycleError::ShutdownTimeout(DEFAULT_SHUTDOWN_GRACE))
}

/// Connects to an already-running daemon, starting one first if none answers.
#[cfg(unix)]
pub async fn get_daemon_client(binary_path: &Path) -> Result<Client, LifecycleError> {
    let socket = socket_path();
    if let Some(client) = Client::try_connect_unix(&socket).await {
        return Ok(client);
    }
    start_daemon(binary_path, &socket, &database_path(), &log_path(), false, DEFAULT_STARTUP_TIMEOUT).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_lock_refuses_a_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("worker.lock");
        let first = PidLock::acquire(&lock_path).unwrap();
        let second = PidLock::acquire(&lock_path);
        assert!(matches!(second, Err(LifecycleError::LockHeld(_))));
        drop(first);
    }

    #[test]
    fn pid_lock_can_be_reacquired_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("worker.lock");
        let first = PidLock::acquire(&lock_path).unwrap();
        drop(first);
        let second = PidLock::acquire(&lock_path);
        assert!(second.is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn is_running_is_false_for_a_nonexistent_socket() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_running(&dir.path().join("nope.sock")).await);
    }
}
