//! The message-list state machine: normalize, call the provider, run any
//! requested tools, and repeat until the model stops asking for tools, a
//! turn limit is hit, or the run is cancelled.

pub mod hooks;

pub use hooks::Hooks;

use crate::cancel::CancelToken;
use crate::message::{normalize, Message, NormalizationError};
use crate::provider::{CompletionRequest, Dialect, FinishReason, ProviderAdapter, ProviderError};
use crate::tools::{ExecutorError, ToolContext, ToolDescriptor, ToolExecutor, ToolRegistry};
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_MAX_TURNS: usize = 64;

/// Everything a loop (and any sub-agent it spawns) needs to talk to a
/// provider: which dialect, where, with what credentials, under what model
/// and system prompt, bounded by how many turns a single run may take.
#[derive(Clone)]
pub struct LlmConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub dialect: Option<Dialect>,
    pub base_url: String,
    pub api_key: String,
    pub max_turns: usize,
    /// `Some(n)` enables extended thinking with a budget of `n` tokens;
    /// `None` leaves thinking off. Only the Claude dialect honors this.
    pub thinking_budget: Option<u32>,
}

impl LlmConfig {
    pub fn new(model: String, base_url: String, api_key: String) -> Self {
        Self {
            model,
            system_prompt: None,
            dialect: None,
            base_url,
            api_key,
            max_turns: DEFAULT_MAX_TURNS,
            thinking_budget: None,
        }
    }

    pub fn build_adapter(&self) -> Arc<dyn ProviderAdapter> {
        let dialect = crate::provider::select_dialect(self.dialect, &self.model);
        crate::provider::build_adapter(dialect, self.base_url.clone(), self.api_key.clone())
    }
}

#[derive(Debug, Error)]
pub enum AgentLoopError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("exceeded max turns ({0})")]
    MaxTurnsExceeded(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTurns,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub messages: Vec<Message>,
    pub stop_reason: StopReason,
}

pub struct AgentLoop {
    adapter: Arc<dyn ProviderAdapter>,
    executor: ToolExecutor,
    config: LlmConfig,
    tools: Vec<ToolDescriptor>,
    hooks: Hooks,
}

impl AgentLoop {
    pub fn new(config: LlmConfig, registry: Arc<ToolRegistry>) -> Self {
        let adapter = config.build_adapter();
        let tools = registry.descriptors().cloned().collect();
        Self {
            adapter,
            executor: ToolExecutor::new(registry),
            config,
            tools,
            hooks: Hooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Runs the loop to completion starting from `initial_messages`. Returns
    /// the full message list (including every intermediate assistant and
    /// tool-result message appended along the way) and why the run stopped.
    pub async fn run(
        &self,
        initial_messages: Vec<Message>,
        cwd: std::path::PathBuf,
        cancel: CancelToken,
    ) -> Result<RunOutcome, AgentLoopError> {
        self.hooks.fire_query_start();
        let mut messages = initial_messages;

        for turn in 0..self.config.max_turns {
            if cancel.is_cancelled() {
                self.hooks.fire_abort();
                return Ok(RunOutcome { messages, stop_reason: StopReason::Cancelled });
            }

            let normalized = normalize(&messages)?;
            messages = normalized;

            let request = CompletionRequest {
                messages: messages.clone(),
                system_prompt: self.config.system_prompt.clone(),
                tools: self.tools.clone(),
                model: self.config.model.clone(),
                thinking_budget: self.config.thinking_budget,
            };
            self.hooks.fire_llm_request(&request);

            let response = match self.adapter.complete(request, &cancel).await {
                Ok(r) => r,
                Err(ProviderError::Cancelled) => {
                    self.hooks.fire_abort();
                    return Ok(RunOutcome { messages, stop_reason: StopReason::Cancelled });
                }
                Err(e) => {
                    self.hooks.fire_error(&e.to_string());
                    return Err(e.into());
                }
            };
            self.hooks.fire_llm_response(&response);

            let assistant = Message::assistant(response.content.clone().into(), response.usage);
            messages.push(assistant.clone());

            let tool_uses = assistant.tool_use_blocks();
            if tool_uses.is_empty() || response.finish_reason != FinishReason::ToolUse {
                self.hooks.fire_query_end(&messages);
                return Ok(RunOutcome { messages, stop_reason: StopReason::EndTurn });
            }

            let blocks = tool_uses;
            for b in &blocks {
                if let crate::message::ContentBlock::ToolUse { name, .. } = b {
                    self.hooks.fire_tool_start(name);
                }
            }

            let hooks = self.hooks.clone();
            let mut ctx = ToolContext::new(cwd.clone(), cancel.child());
            ctx.llm_config = Some(Arc::new(self.config.clone()));
            ctx.stream_sink = Some(Arc::new(move |item| hooks.fire_tool_progress(item)));

            let result_message = self.executor.run(&blocks, &ctx).await?;
            for b in &blocks {
                if let crate::message::ContentBlock::ToolUse { name, .. } = b {
                    self.hooks.fire_tool_complete(name);
                }
            }
            messages.push(result_message);

            if turn + 1 == self.config.max_turns {
                self.hooks.fire_query_end(&messages);
                return Ok(RunOutcome { messages, stop_reason: StopReason::MaxTurns });
            }
        }

        Err(AgentLoopError::MaxTurnsExceeded(self.config.max_turns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Content, ContentBlock};
    use crate::provider::CompletionResponse;
    use crate::tools::{Tool, ToolCallItem, ToolError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedAdapter {
        responses: std::sync::Mutex<Vec<CompletionResponse>>,
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        async fn complete(
            &self,
            _request: CompletionRequest,
            _cancel: &CancelToken,
        ) -> Result<CompletionResponse, ProviderError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(ProviderError::Malformed("script exhausted".into()));
            }
            Ok(responses.remove(0))
        }
    }

    struct EchoTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn is_read_only(&self, _input: &serde_json::Value) -> bool {
            true
        }
        fn is_concurrency_safe(&self, _input: &serde_json::Value) -> bool {
            true
        }
        async fn call(
            &self,
            input: serde_json::Value,
            _ctx: ToolContext,
            emit: Arc<dyn Fn(ToolCallItem) + Send + Sync>,
        ) -> Result<(), ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            emit(ToolCallItem::Result { data: input, result_for_assistant: Some("ok".into()), is_error: false });
            Ok(())
        }
    }

    fn registry_with_echo(calls: Arc<AtomicUsize>) -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register(ToolDescriptor {
            name: "echo".to_string(),
            description: String::new(),
            input_schema: serde_json::json!({"type": "object"}),
            tool: Arc::new(EchoTool { calls }),
        });
        Arc::new(reg)
    }

    #[tokio::test]
    async fn terminates_when_no_tool_use_requested() {
        let adapter = ScriptedAdapter {
            responses: std::sync::Mutex::new(vec![CompletionResponse {
                content: vec![ContentBlock::Text { text: "done".into() }],
                usage: None,
                finish_reason: FinishReason::Stop,
            }]),
        };
        let config = LlmConfig::new("gpt-test".into(), "http://localhost".into(), "key".into());
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with_echo(calls.clone());
        let mut agent = AgentLoop::new(config, registry);
        agent.adapter = Arc::new(adapter);

        let initial = vec![Message::user(Content::Text("hi".into()))];
        let outcome = agent.run(initial, std::path::PathBuf::from("."), CancelToken::new()).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::EndTurn);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn runs_tool_then_terminates_on_next_stop() {
        let adapter = ScriptedAdapter {
            responses: std::sync::Mutex::new(vec![
                CompletionResponse {
                    content: vec![ContentBlock::ToolUse {
                        id: "1".into(),
                        name: "echo".into(),
                        input: serde_json::Map::new(),
                    }],
                    usage: None,
                    finish_reason: FinishReason::ToolUse,
                },
                CompletionResponse {
                    content: vec![ContentBlock::Text { text: "done".into() }],
                    usage: None,
                    finish_reason: FinishReason::Stop,
                },
            ]),
        };
        let config = LlmConfig::new("gpt-test".into(), "http://localhost".into(), "key".into());
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with_echo(calls.clone());
        let mut agent = AgentLoop::new(config, registry);
        agent.adapter = Arc::new(adapter);

        let initial = vec![Message::user(Content::Text("hi".into()))];
        let outcome = agent.run(initial, std::path::PathBuf::from("."), CancelToken::new()).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::EndTurn);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // user msg, assistant tool_use, tool_result, assistant final
        assert_eq!(outcome.messages.len(), 4);
    }

    #[tokio::test]
    async fn cancellation_before_first_turn_stops_immediately() {
        let adapter = ScriptedAdapter { responses: std::sync::Mutex::new(vec![]) };
        let config = LlmConfig::new("gpt-test".into(), "http://localhost".into(), "key".into());
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with_echo(calls);
        let mut agent = AgentLoop::new(config, registry);
        agent.adapter = Arc::new(adapter);

        let cancel = CancelToken::new();
        cancel.cancel();
        let initial = vec![Message::user(Content::Text("hi".into()))];
        let outcome = agent.run(initial, std::path::PathBuf::from("."), cancel).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
    }
}
