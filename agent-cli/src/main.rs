//! Thin CLI shell over the worker daemon: parse options, start or find
//! `workerd`, submit one `execute` request, stream the reply to stdout.
//! No agent-loop logic lives here — it all runs inside the daemon.

mod logging;

use agent_worker::lifecycle;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "agent")]
#[command(about = "Run a coding-assistant turn against the worker daemon")]
struct Args {
    /// User message (or pass as trailing positional words).
    #[arg(short, long, value_name = "TEXT")]
    message: Option<String>,

    #[arg(trailing_var_arg = true)]
    rest: Vec<String>,

    /// Model name. Overrides AGENT_MODEL.
    #[arg(long, value_name = "MODEL")]
    model: Option<String>,

    /// Provider base URL. Overrides AGENT_BASE_URL/ANTHROPIC_BASE_URL.
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// API key. Overrides AGENT_API_KEY/ANTHROPIC_API_KEY.
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,

    /// Working folder tools run against. Default: current directory.
    #[arg(short, long, value_name = "DIR")]
    working_folder: Option<PathBuf>,

    /// Continue a previous session instead of starting a new one.
    #[arg(long, value_name = "ID")]
    session_id: Option<String>,

    /// Log node-level progress (tool start/complete) to stderr.
    #[arg(short, long)]
    verbose: bool,

    /// Enable extended thinking.
    #[arg(long)]
    thinking: bool,

    /// Thinking token budget. Implies --thinking; ignored otherwise.
    #[arg(long, value_name = "TOKENS")]
    thinking_budget: Option<u32>,

    /// Force a wire dialect instead of inferring it from the model name.
    #[arg(long, value_name = "DIALECT", value_parser = ["claude", "chat_completions"])]
    provider: Option<String>,
}

fn resolve_message(args: &Args) -> Option<String> {
    args.message.clone().or_else(|| if args.rest.is_empty() { None } else { Some(args.rest.join(" ")) })
}

#[tokio::main]
async fn main() {
    agent_config::load_and_apply("agent", None::<&std::path::Path>).ok();
    if let Err(e) = logging::init() {
        eprintln!("agent: failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let args = Args::parse();
    let message = match resolve_message(&args) {
        Some(m) if !m.trim().is_empty() => m,
        _ => {
            eprintln!("agent: provide a message via -m/--message or trailing words");
            std::process::exit(1);
        }
    };

    let settings = agent_config::resolve_settings();
    let model = args.model.or(settings.model).unwrap_or_default();
    let base_url = args.base_url.or(settings.base_url).unwrap_or_default();
    let api_key = args.api_key.or(settings.api_key).unwrap_or_default();
    if api_key.is_empty() {
        eprintln!("agent: no API key configured (set AGENT_API_KEY or pass --api-key)");
        std::process::exit(1);
    }

    let thinking_budget = args.thinking_budget.or(if args.thinking { Some(16_000) } else { None });
    let project_root = args.working_folder.unwrap_or_else(|| PathBuf::from("."));

    let workerd_path = match std::env::current_exe().ok().and_then(|p| p.parent().map(|d| d.join("workerd"))) {
        Some(p) if p.exists() => p,
        _ => PathBuf::from("workerd"),
    };

    let client = match lifecycle::get_daemon_client(&workerd_path).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("agent: could not reach or start the worker daemon: {e}");
            std::process::exit(1);
        }
    };

    let mut payload = serde_json::json!({
        "prompt": message,
        "model": model,
        "baseUrl": base_url,
        "apiKey": api_key,
        "projectRoot": project_root.display().to_string(),
    });
    if let Some(id) = &args.session_id {
        payload["sessionId"] = serde_json::Value::String(id.clone());
    }
    if let Some(budget) = thinking_budget {
        payload["thinkingBudget"] = serde_json::json!(budget);
    }
    if let Some(dialect) = &args.provider {
        payload["dialect"] = serde_json::Value::String(dialect.clone());
    }

    let started = match client.request("execute", Some(payload)).await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("agent: {e}");
            std::process::exit(1);
        }
    };
    let task_id = match started.get("taskId").and_then(|v| v.as_str()) {
        Some(id) => id.to_string(),
        None => {
            eprintln!("agent: worker response missing taskId");
            std::process::exit(1);
        }
    };

    let mut reply = String::new();
    let verbose = args.verbose;
    let result = client
        .stream_output(
            &task_id,
            |chunk| {
                let kind = chunk.get("chunk_type").and_then(|v| v.as_str()).unwrap_or("");
                let content = chunk.get("content").and_then(|v| v.as_str()).unwrap_or("");
                match kind {
                    "text" => reply.push_str(content),
                    "tool_use" if verbose => {
                        let name = chunk.get("attrs").and_then(|a| a.get("tool_name")).and_then(|v| v.as_str()).unwrap_or("tool");
                        eprintln!("agent: running {name}");
                    }
                    _ => {}
                }
            },
            std::time::Duration::from_millis(200),
        )
        .await;

    if let Err(e) = result {
        eprintln!("agent: {e}");
        std::process::exit(1);
    }

    println!("{reply}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn message_flag_wins_over_trailing_words() {
        let args = Args::parse_from(["agent", "-m", "flag text", "trailing", "words"]);
        assert_eq!(resolve_message(&args), Some("flag text".to_string()));
    }

    #[test]
    fn trailing_words_join_into_one_message() {
        let args = Args::parse_from(["agent", "fix", "the", "bug"]);
        assert_eq!(resolve_message(&args), Some("fix the bug".to_string()));
    }

    #[test]
    fn no_message_and_no_trailing_words_is_none() {
        let args = Args::parse_from(["agent"]);
        assert_eq!(resolve_message(&args), None);
    }

    #[test]
    fn thinking_budget_flag_is_honored_without_toggle() {
        let args = Args::parse_from(["agent", "--thinking-budget", "4096", "hi"]);
        assert_eq!(args.thinking_budget, Some(4096));
        assert!(!args.thinking);
    }
}
