//! Bootstraps a worker daemon on a remote host over SSH: build a
//! non-interactive argument vector, probe/install the remote runtime,
//! upload the worker script, launch it, and parse its startup line.

use crate::askpass;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Clone, Debug)]
pub enum AuthMethod {
    Key { key_path: PathBuf },
    Password { password: String },
    Agent,
}

#[derive(Clone, Debug)]
pub struct HostDescriptor {
    pub id: Option<String>,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

impl HostDescriptor {
    /// Stable pool key: the explicit `id` if set, else `user@host:port`.
    pub fn connection_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| format!("{}@{}:{}", self.username, self.hostname, self.port))
    }
}

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    pub connect_timeout: Duration,
    pub idle_timeout_secs: u64,
    pub allow_install: bool,
    /// Command run over SSH to check whether the worker binary is already
    /// present on the remote host (e.g. `command -v workerd`).
    pub runtime_probe_command: String,
    /// Command run over SSH when the probe fails and `allow_install` is set.
    pub install_command: String,
    /// Contents of the launcher script, uploaded verbatim via `cat > path`.
    pub worker_script: String,
    pub remote_script_path: String,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("ssh failed: {0}")]
    Ssh(String),
    #[error("runtime probe/install failed: {0}")]
    InstallFailed(String),
    #[error("failed to upload worker script: {0}")]
    UploadFailed(String),
    #[error("could not parse DAEMON_STARTED line: {0}")]
    ParseFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct StartedLine {
    port: u16,
    token: String,
    pid: u32,
}

#[derive(Clone, Debug)]
pub struct DaemonInfo {
    pub host: String,
    pub port: u16,
    /// The locally generated token, stamped here rather than the one the
    /// remote process echoed back — a log watcher on the remote host seeing
    /// the printed token should not be able to impersonate this session.
    pub token: String,
    pub pid: u32,
}

/// Builds the non-interactive SSH argument vector described by the auth
/// method: `BatchMode=yes` for key/agent auth (never prompts), omitted for
/// password auth so `SSH_ASKPASS` can supply it instead.
fn ssh_base_args(host: &HostDescriptor, config: &BootstrapConfig) -> Vec<String> {
    let mut args = vec!["-o".to_string(), "StrictHostKeyChecking=accept-new".to_string()];
    args.push("-o".to_string());
    args.push(format!("ConnectTimeout={}", config.connect_timeout.as_secs().max(1)));
    if !matches!(host.auth, AuthMethod::Password { .. }) {
        args.push("-o".to_string());
        args.push("BatchMode=yes".to_string());
    }
    if let AuthMethod::Key { key_path } = &host.auth {
        args.push("-i".to_string());
        args.push(key_path.display().to_string());
    }
    args.push("-p".to_string());
    args.push(host.port.to_string());
    args.push(format!("{}@{}", host.username, host.hostname));
    args
}

fn ssh_command(host: &HostDescriptor, config: &BootstrapConfig, askpass_path: Option<&std::path::Path>) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.args(ssh_base_args(host, config));
    if let AuthMethod::Password { .. } = &host.auth {
        if let Some(path) = askpass_path {
            cmd.env("SSH_ASKPASS", path);
            cmd.env("SSH_ASKPASS_REQUIRE", "force");
            cmd.env_remove("DISPLAY");
        }
    }
    cmd
}

async fn run_remote(host: &HostDescriptor, config: &BootstrapConfig, remote_command: &str) -> Result<std::process::Output, BootstrapError> {
    let askpass_dir = std::env::temp_dir().join("agent-remote-askpass");
    let askpass_path = match &host.auth {
        AuthMethod::Password { password } => Some(askpass::write_askpass_script(&askpass_dir, password)?),
        _ => None,
    };

    let mut cmd = ssh_command(host, config, askpass_path.as_deref());
    cmd.arg(remote_command);
    let result = cmd.output().await.map_err(|e| BootstrapError::Ssh(e.to_string()));

    if let Some(path) = &askpass_path {
        askpass::remove(path);
    }
    result.map_err(Into::into)
}

/// Runs the full bootstrap sequence, returning the locally-stamped
/// `DaemonInfo` once the remote worker's startup line has been parsed.
pub async fn bootstrap(host: &HostDescriptor, config: &BootstrapConfig) -> Result<DaemonInfo, BootstrapError> {
    probe_and_install(host, config).await?;
    upload_worker_script(host, config).await?;
    launch(host, config).await
}

async fn probe_and_install(host: &HostDescriptor, config: &BootstrapConfig) -> Result<(), BootstrapError> {
    let probe = run_remote(host, config, &config.runtime_probe_command).await?;
    if probe.status.success() {
        return Ok(());
    }
    if !config.allow_install {
        return Err(BootstrapError::InstallFailed(String::from_utf8_lossy(&probe.stderr).into_owned()));
    }
    let install = run_remote(host, config, &config.install_command).await?;
    if !install.status.success() {
        return Err(BootstrapError::InstallFailed(String::from_utf8_lossy(&install.stderr).into_owned()));
    }
    Ok(())
}

async fn upload_worker_script(host: &HostDescriptor, config: &BootstrapConfig) -> Result<(), BootstrapError> {
    let askpass_dir = std::env::temp_dir().join("agent-remote-askpass");
    let askpass_path = match &host.auth {
        AuthMethod::Password { password } => Some(askpass::write_askpass_script(&askpass_dir, password)?),
        _ => None,
    };

    let mut cmd = ssh_command(host, config, askpass_path.as_deref());
    cmd.arg(format!("cat > {}", config.remote_script_path));
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let mut child = cmd.spawn()?;
    {
        let mut stdin = child.stdin.take().ok_or_else(|| BootstrapError::UploadFailed("no stdin".into()))?;
        stdin.write_all(config.worker_script.as_bytes()).await?;
        stdin.shutdown().await?;
    }
    let output = child.wait_with_output().await?;

    if let Some(path) = &askpass_path {
        askpass::remove(path);
    }

    if !output.status.success() {
        return Err(BootstrapError::UploadFailed(String::from_utf8_lossy(&output.stderr).into_owned()));
    }
    Ok(())
}

async fn launch(host: &HostDescriptor, config: &BootstrapConfig) -> Result<DaemonInfo, BootstrapError> {
    let token = uuid::Uuid::new_v4().to_string();
    let remote_command = format!(
        "nohup sh {} 0 {} {} >/tmp/agent-remote-worker.log 2>&1 & disown; wait $!",
        config.remote_script_path, token, config.idle_timeout_secs
    );
    // The script itself prints DAEMON_STARTED once it has bound its port and
    // is accepting connections; `run_remote` waits for that exec to return,
    // which the launcher script is expected to do promptly after printing it.
    let output = run_remote(host, config, &remote_command).await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .find(|l| l.starts_with("DAEMON_STARTED:"))
        .ok_or_else(|| BootstrapError::ParseFailed(format!("no DAEMON_STARTED line in: {stdout}")))?;
    let json_part = line.trim_start_matches("DAEMON_STARTED:");
    let started: StartedLine = serde_json::from_str(json_part).map_err(|e| BootstrapError::ParseFailed(e.to_string()))?;

    Ok(DaemonInfo { host: host.hostname.clone(), port: started.port, token, pid: started.pid })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_host() -> HostDescriptor {
        HostDescriptor {
            id: None,
            hostname: "example.internal".into(),
            port: 22,
            username: "deploy".into(),
            auth: AuthMethod::Key { key_path: PathBuf::from("/home/deploy/.ssh/id_ed25519") },
        }
    }

    fn base_config() -> BootstrapConfig {
        BootstrapConfig {
            connect_timeout: Duration::from_secs(10),
            idle_timeout_secs: 1800,
            allow_install: false,
            runtime_probe_command: "command -v workerd".into(),
            install_command: "true".into(),
            worker_script: "#!/bin/sh\necho hi\n".into(),
            remote_script_path: "/tmp/worker.sh".into(),
        }
    }

    #[test]
    fn key_auth_sets_batch_mode_and_identity_file() {
        let args = ssh_base_args(&key_host(), &base_config());
        assert!(args.iter().any(|a| a == "BatchMode=yes"));
        assert!(args.iter().any(|a| a.contains("id_ed25519")));
        assert!(args.iter().any(|a| a == "deploy@example.internal"));
    }

    #[test]
    fn password_auth_omits_batch_mode() {
        let host = HostDescriptor { auth: AuthMethod::Password { password: "secret".into() }, ..key_host() };
        let args = ssh_base_args(&host, &base_config());
        assert!(!args.iter().any(|a| a == "BatchMode=yes"));
    }

    #[test]
    fn connection_id_defaults_to_user_host_port() {
        let host = key_host();
        assert_eq!(host.connection_id(), "deploy@example.internal:22");
    }

    #[test]
    fn connection_id_prefers_explicit_id() {
        let host = HostDescriptor { id: Some("prod-1".into()), ..key_host() };
        assert_eq!(host.connection_id(), "prod-1");
    }

    #[test]
    fn started_line_is_parsed_from_surrounding_output() {
        let stdout = "some banner\nDAEMON_STARTED:{\"port\":9001,\"token\":\"printed-token\",\"pid\":4242}\ntrailer\n";
        let line = stdout.lines().find(|l| l.starts_with("DAEMON_STARTED:")).unwrap();
        let started: StartedLine = serde_json::from_str(line.trim_start_matches("DAEMON_STARTED:")).unwrap();
        assert_eq!(started.port, 9001);
        assert_eq!(started.pid, 4242);
    }
}
