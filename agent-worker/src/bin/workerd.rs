//! The `workerd` daemon binary: loads configuration, opens the store,
//! and serves the IPC protocol until `shutdown` or, in idle-exit mode,
//! until no task has run for a while.

use agent_worker::Server;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Parser, Debug)]
#[command(name = "workerd")]
#[command(about = "Background daemon that owns agent sessions independently of any front-end")]
struct Args {
    /// Path to the Unix domain socket (or, on Windows, ignored in favor of --port).
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Loopback TCP port to listen on (used on platforms without Unix sockets).
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Path to the embedded sqlite store.
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Path to append daemon logs to. Defaults to stdout (expected to already
    /// be redirected to a log file by whoever spawned this process).
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Stay alive indefinitely. Without this flag, the daemon exits after
    /// `idle_timeout_secs` of no running tasks.
    #[arg(long)]
    keep_alive: bool,

    /// Idle timeout in seconds before a non-keep-alive daemon exits.
    #[arg(long, default_value_t = 1800)]
    idle_timeout_secs: u64,
}

fn init_logging(log_file: Option<&PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if let Some(path) = log_file {
        let file_appender = tracing_appender::rolling::never(path.parent().unwrap_or_else(|| std::path::Path::new(".")), path.file_name().unwrap_or_default());
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leak the guard: the daemon runs for the life of the process, so there
        // is no later point at which flushing-on-drop would help.
        Box::leak(Box::new(guard));
        let layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false).with_filter(filter);
        tracing_subscriber::registry().with(layer).init();
    } else {
        let layer = tracing_subscriber::fmt::layer().with_filter(filter);
        tracing_subscriber::registry().with(layer).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    agent_config::load_and_apply("agent", None::<&std::path::Path>).ok();

    let args = Args::parse();
    init_logging(args.log_file.as_ref())?;

    let socket = args.socket.unwrap_or_else(agent_worker::lifecycle::socket_path);
    let db_path = args.db.unwrap_or_else(agent_worker::lifecycle::database_path);
    let lock_path = agent_worker::lifecycle::pid_lock_path();

    let _pid_lock = agent_worker::lifecycle::PidLock::acquire(&lock_path).map_err(|e| {
        tracing::error!(error = %e, "failed to acquire daemon lock");
        e
    })?;

    let registry = Arc::new(agent_core::ToolRegistry::new());
    let server = Arc::new(Server::open(&db_path, registry)?);

    if !args.keep_alive {
        let state = server.state();
        let idle_timeout = Duration::from_secs(args.idle_timeout_secs);
        tokio::spawn(async move {
            idle_watchdog(state, idle_timeout).await;
            tracing::info!("idle timeout reached, exiting");
            std::process::exit(0);
        });
    }

    tracing::info!(socket = %socket.display(), db = %db_path.display(), "workerd starting");

    #[cfg(unix)]
    {
        if let Some(port) = args.port {
            server.serve_tcp(port).await?;
        } else {
            server.serve_unix(&socket).await?;
        }
    }
    #[cfg(not(unix))]
    {
        server.serve_tcp(args.port.unwrap_or(0)).await?;
    }

    Ok(())
}

/// Exits the process once no task has been running continuously for
/// `idle_timeout`. Resets whenever the running-task set becomes non-empty.
async fn idle_watchdog(state: Arc<agent_worker::ServerState>, idle_timeout: Duration) {
    let mut idle_since: Option<tokio::time::Instant> = Some(tokio::time::Instant::now());
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let busy = !state.running.lock().unwrap().is_empty();
        if busy {
            idle_since = None;
            continue;
        }
        let since = idle_since.get_or_insert_with(tokio::time::Instant::now);
        if since.elapsed() >= idle_timeout {
            return;
        }
    }
}
