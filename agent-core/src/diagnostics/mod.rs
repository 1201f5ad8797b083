//! Classifies a failed command's stderr into a failure family and drives a
//! bounded auto-fix retry loop around a caller-supplied command runner.

use async_trait::async_trait;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureFamily {
    Timeout,
    Dns,
    Ssl,
    HttpClient(u16),
    HttpServer(u16),
    Permission,
    DiskFull,
    DependencyMissing,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fix {
    SetEnv { key: String, value: String },
    UseMirror { url: String },
    RetryWithTimeout { ms: u64 },
    Custom { command: String },
}

#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub family: FailureFamily,
    pub auto_fixable: bool,
    pub suggested_fixes: Vec<Fix>,
    pub requires_user_input: bool,
    pub user_question: Option<String>,
}

pub fn classify(stderr: &str) -> Diagnosis {
    let lower = stderr.to_lowercase();

    if lower.contains("timed out") || lower.contains("timeout") {
        return Diagnosis {
            family: FailureFamily::Timeout,
            auto_fixable: true,
            suggested_fixes: vec![Fix::RetryWithTimeout { ms: 60_000 }],
            requires_user_input: false,
            user_question: None,
        };
    }
    if lower.contains("could not resolve host") || lower.contains("name or service not known") || lower.contains("dns") {
        return Diagnosis {
            family: FailureFamily::Dns,
            auto_fixable: false,
            suggested_fixes: vec![],
            requires_user_input: true,
            user_question: Some("DNS resolution failed; check network connectivity. Continue anyway?".to_string()),
        };
    }
    if lower.contains("ssl") || lower.contains("certificate verify failed") || lower.contains("tls") {
        return Diagnosis {
            family: FailureFamily::Ssl,
            auto_fixable: true,
            suggested_fixes: vec![Fix::SetEnv { key: "SSL_CERT_FILE".to_string(), value: String::new() }],
            requires_user_input: false,
            user_question: None,
        };
    }
    if let Some(status) = extract_http_status(&lower) {
        return if (400..500).contains(&status) {
            Diagnosis {
                family: FailureFamily::HttpClient(status),
                auto_fixable: status == 429,
                suggested_fixes: if status == 429 { vec![Fix::RetryWithTimeout { ms: 5_000 }] } else { vec![] },
                requires_user_input: status != 429,
                user_question: if status == 429 { None } else { Some(format!("Request failed with HTTP {status}. Continue?")) },
            }
        } else {
            Diagnosis {
                family: FailureFamily::HttpServer(status),
                auto_fixable: true,
                suggested_fixes: vec![Fix::RetryWithTimeout { ms: 3_000 }],
                requires_user_input: false,
                user_question: None,
            }
        };
    }
    if lower.contains("permission denied") || lower.contains("eacces") {
        return Diagnosis {
            family: FailureFamily::Permission,
            auto_fixable: false,
            suggested_fixes: vec![],
            requires_user_input: true,
            user_question: Some("Permission denied; retry with elevated access?".to_string()),
        };
    }
    if lower.contains("no space left") || lower.contains("disk full") {
        return Diagnosis {
            family: FailureFamily::DiskFull,
            auto_fixable: false,
            suggested_fixes: vec![],
            requires_user_input: true,
            user_question: Some("Disk is full; free space and retry?".to_string()),
        };
    }
    if lower.contains("command not found")
        || lower.contains("not installed")
        || (lower.contains("no such file or directory") && lower.contains("npm"))
    {
        return Diagnosis {
            family: FailureFamily::DependencyMissing,
            auto_fixable: true,
            suggested_fixes: vec![Fix::UseMirror { url: "https://registry.npmmirror.com".to_string() }],
            requires_user_input: false,
            user_question: None,
        };
    }

    Diagnosis {
        family: FailureFamily::Unknown,
        auto_fixable: false,
        suggested_fixes: vec![],
        requires_user_input: true,
        user_question: Some("The command failed in an unrecognized way. How should I proceed?".to_string()),
    }
}

fn extract_http_status(lower: &str) -> Option<u16> {
    let idx = lower.find("http")?;
    lower[idx..]
        .split_whitespace()
        .find_map(|tok| tok.chars().filter(|c| c.is_ascii_digit()).collect::<String>().parse::<u16>().ok())
        .filter(|s| (400..600).contains(s))
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstraction over "run a command", so the retry loop stays test-friendly.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, env_overrides: &[(String, String)]) -> CommandResult;
}

#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub result: CommandResult,
    pub attempts: u32,
    pub diagnosis: Option<Diagnosis>,
}

fn fix_kind(fix: &Fix) -> &'static str {
    match fix {
        Fix::SetEnv { .. } => "set_env",
        Fix::UseMirror { .. } => "use_mirror",
        Fix::RetryWithTimeout { .. } => "retry_with_timeout",
        Fix::Custom { .. } => "custom",
    }
}

/// Runs `command` under `runner`, applying at most one auto-fixable
/// classified failure of each kind, up to `budget` total attempts.
pub async fn run_with_diagnostics(
    runner: &dyn CommandRunner,
    command: &str,
    budget: u32,
) -> RetryOutcome {
    let mut env_overrides: Vec<(String, String)> = Vec::new();
    let mut applied_kinds: HashSet<&'static str> = HashSet::new();
    let mut last_diagnosis = None;
    let mut attempts = 0;

    loop {
        attempts += 1;
        let result = runner.run(command, &env_overrides).await;
        if result.success() {
            return RetryOutcome { result, attempts, diagnosis: None };
        }

        let diagnosis = classify(&result.stderr);
        if !diagnosis.auto_fixable || attempts >= budget {
            let diagnosis = Some(diagnosis);
            return RetryOutcome { result, attempts, diagnosis };
        }

        let unapplied_fix = diagnosis
            .suggested_fixes
            .iter()
            .find(|f| !applied_kinds.contains(fix_kind(f)));

        match unapplied_fix {
            Some(Fix::SetEnv { key, value }) => {
                env_overrides.push((key.clone(), value.clone()));
                applied_kinds.insert("set_env");
            }
            Some(Fix::UseMirror { .. }) => {
                applied_kinds.insert("use_mirror");
            }
            Some(Fix::RetryWithTimeout { .. }) => {
                applied_kinds.insert("retry_with_timeout");
            }
            Some(Fix::Custom { .. }) => {
                applied_kinds.insert("custom");
            }
            None => {
                last_diagnosis = Some(diagnosis);
                return RetryOutcome { result, attempts, diagnosis: last_diagnosis };
            }
        }
        last_diagnosis = Some(diagnosis);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedRunner {
        outcomes: Vec<CommandResult>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, _command: &str, _env: &[(String, String)]) -> CommandResult {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.outcomes.get(idx).cloned().unwrap_or(CommandResult {
                stdout: String::new(),
                stderr: "exhausted".to_string(),
                exit_code: 1,
            })
        }
    }

    #[test]
    fn classifies_timeout_as_auto_fixable() {
        let d = classify("connect: connection timed out");
        assert_eq!(d.family, FailureFamily::Timeout);
        assert!(d.auto_fixable);
    }

    #[test]
    fn classifies_permission_as_requiring_user_input() {
        let d = classify("open /etc/shadow: permission denied");
        assert_eq!(d.family, FailureFamily::Permission);
        assert!(d.requires_user_input);
    }

    #[tokio::test]
    async fn succeeds_immediately_without_retry() {
        let runner = ScriptedRunner {
            outcomes: vec![CommandResult { stdout: "ok".into(), stderr: String::new(), exit_code: 0 }],
            calls: AtomicU32::new(0),
        };
        let outcome = run_with_diagnostics(&runner, "echo ok", 3).await;
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.diagnosis.is_none());
    }

    #[tokio::test]
    async fn retries_transient_timeout_then_succeeds() {
        let runner = ScriptedRunner {
            outcomes: vec![
                CommandResult { stdout: String::new(), stderr: "connection timed out".into(), exit_code: 1 },
                CommandResult { stdout: "ok".into(), stderr: String::new(), exit_code: 0 },
            ],
            calls: AtomicU32::new(0),
        };
        let outcome = run_with_diagnostics(&runner, "curl example.com", 3).await;
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.result.success());
    }

    #[tokio::test]
    async fn exhausts_budget_and_surfaces_diagnosis() {
        let runner = ScriptedRunner {
            outcomes: vec![
                CommandResult { stdout: String::new(), stderr: "connection timed out".into(), exit_code: 1 },
                CommandResult { stdout: String::new(), stderr: "connection timed out".into(), exit_code: 1 },
            ],
            calls: AtomicU32::new(0),
        };
        let outcome = run_with_diagnostics(&runner, "curl example.com", 2).await;
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.diagnosis.is_some());
    }

    #[tokio::test]
    async fn non_auto_fixable_failure_stops_after_first_attempt() {
        let runner = ScriptedRunner {
            outcomes: vec![CommandResult { stdout: String::new(), stderr: "permission denied".into(), exit_code: 1 }],
            calls: AtomicU32::new(0),
        };
        let outcome = run_with_diagnostics(&runner, "cat /etc/shadow", 3).await;
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.diagnosis.unwrap().requires_user_input);
    }
}
