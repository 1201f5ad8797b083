//! Converts agent-facing requests to one of two LLM wire dialects and
//! normalizes the response back into the uniform [`CompletionResponse`].

mod chat_completions;
mod claude;

pub use chat_completions::ChatCompletionsAdapter;
pub use claude::ClaudeAdapter;

use crate::message::{ContentBlock, Message, Usage};
use crate::tools::ToolDescriptor;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolUse,
    Length,
    Error,
}

#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDescriptor>,
    pub model: String,
    pub thinking_budget: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct CompletionResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Option<Usage>,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("server error: {status} {body}")]
    Server { status: u16, body: String },
    #[error("client error: {status} {body}")]
    Client { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Transient failures (timeout, 429, 5xx) are worth a bounded retry at
    /// the adapter; everything else is a permanent, fatal turn outcome.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout | ProviderError::RateLimited { .. } | ProviderError::Server { .. } | ProviderError::Network(_)
        )
    }
}

/// Uniform provider-facing contract. Two dialects implement it: a generic
/// chat-completions backend and a Claude-style messages API backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &crate::cancel::CancelToken,
    ) -> Result<CompletionResponse, ProviderError>;
}

/// Selects a dialect by explicit configuration, falling back to a model-name
/// heuristic: a name starting with or containing "claude" maps to the Claude
/// dialect; everything else maps to chat-completions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    ChatCompletions,
    Claude,
}

pub fn select_dialect(explicit: Option<Dialect>, model: &str) -> Dialect {
    explicit.unwrap_or_else(|| {
        if model.to_lowercase().contains("claude") {
            Dialect::Claude
        } else {
            Dialect::ChatCompletions
        }
    })
}

/// Builds the adapter for a resolved dialect, given a base URL and API key.
pub fn build_adapter(dialect: Dialect, base_url: String, api_key: String) -> Arc<dyn ProviderAdapter> {
    match dialect {
        Dialect::ChatCompletions => Arc::new(ChatCompletionsAdapter::new(base_url, api_key)),
        Dialect::Claude => Arc::new(ClaudeAdapter::new(base_url, api_key)),
    }
}

/// Bounded retry with backoff for transient provider errors, shared by both
/// dialects. Permanent errors are returned immediately on the first attempt.
pub(crate) async fn with_retry<F, Fut>(
    max_attempts: u32,
    mut attempt: F,
) -> Result<CompletionResponse, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<CompletionResponse, ProviderError>>,
{
    let mut last_err = None;
    for n in 0..max_attempts {
        match attempt().await {
            Ok(r) => return Ok(r),
            Err(e) if e.is_transient() && n + 1 < max_attempts => {
                let backoff_ms = 200u64 * 2u64.pow(n);
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(ProviderError::Network("exhausted retries".into())))
}
