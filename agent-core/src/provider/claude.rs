//! Claude-style messages API dialect.

use super::{with_retry, CompletionRequest, CompletionResponse, FinishReason, ProviderAdapter, ProviderError};
use crate::message::{ContentBlock, Message, Usage};
use crate::tools::ToolDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ATTEMPTS: u32 = 3;

pub struct ClaudeAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ClaudeAdapter {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    fn to_wire_messages(messages: &[Message]) -> (Option<String>, Vec<WireMessage>) {
        let mut system = None;
        let mut out = Vec::new();
        for m in messages {
            match m {
                Message::User { content, .. } => {
                    out.push(WireMessage {
                        role: "user".to_string(),
                        content: content
                            .blocks()
                            .into_iter()
                            .map(WireBlock::from_block)
                            .collect(),
                    });
                }
                Message::Assistant { content, .. } => {
                    out.push(WireMessage {
                        role: "assistant".to_string(),
                        content: content
                            .blocks()
                            .into_iter()
                            .map(WireBlock::from_block)
                            .collect(),
                    });
                }
                Message::Progress { .. } => {}
            }
        }
        // A leading system prompt, if present, is passed separately by the caller;
        // here we only split out the (rare) case where normalization preserved it
        // as the first user text block tagged "system" is not part of this dialect.
        let _ = &mut system;
        (system, out)
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &crate::cancel::CancelToken,
    ) -> Result<CompletionResponse, ProviderError> {
        let (_, wire_messages) = Self::to_wire_messages(&request.messages);
        let tools: Vec<WireTool> = request.tools.iter().map(WireTool::from_descriptor).collect();

        let body = WireRequest {
            model: request.model.clone(),
            system: request.system_prompt.clone(),
            messages: wire_messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
            max_tokens: 4096,
            thinking: request.thinking_budget.map(|budget_tokens| WireThinking { thinking_type: "enabled", budget_tokens }),
        };

        with_retry(MAX_ATTEMPTS, || async {
            let send = self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("content-type", "application/json")
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send();

            let response = tokio::select! {
                r = send => r.map_err(|e| ProviderError::Network(e.to_string()))?,
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            };

            let status = response.status();
            if status.as_u16() == 429 {
                let retry_after_ms = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|s| s * 1000);
                return Err(ProviderError::RateLimited { retry_after_ms });
            }
            if status.is_server_error() {
                let text = response.text().await.unwrap_or_default();
                return Err(ProviderError::Server { status: status.as_u16(), body: text });
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(ProviderError::Client { status: status.as_u16(), body: text });
            }

            let wire: WireResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::Malformed(e.to_string()))?;

            let content = wire.content.into_iter().map(|b| b.into_block()).collect();
            let finish_reason = match wire.stop_reason.as_deref() {
                Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
                Some("tool_use") => FinishReason::ToolUse,
                Some("max_tokens") => FinishReason::Length,
                _ => FinishReason::Stop,
            };

            Ok(CompletionResponse {
                content,
                usage: wire.usage.map(|u| Usage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                }),
                finish_reason,
            })
        })
        .await
    }
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<WireThinking>,
}

#[derive(Serialize)]
struct WireThinking {
    #[serde(rename = "type")]
    thinking_type: &'static str,
    budget_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: Vec<WireBlock>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl WireBlock {
    fn from_block(b: ContentBlock) -> Self {
        match b {
            ContentBlock::Text { text } => WireBlock::Text { text },
            ContentBlock::Thinking { thinking } => WireBlock::Thinking { thinking },
            ContentBlock::ToolUse { id, name, input } => WireBlock::ToolUse {
                id,
                name,
                input: serde_json::Value::Object(input),
            },
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                WireBlock::ToolResult { tool_use_id, content, is_error }
            }
        }
    }

    fn into_block(self) -> ContentBlock {
        match self {
            WireBlock::Text { text } => ContentBlock::Text { text },
            WireBlock::Thinking { thinking } => ContentBlock::Thinking { thinking },
            WireBlock::ToolUse { id, name, input } => ContentBlock::ToolUse {
                id,
                name,
                input: input.as_object().cloned().unwrap_or_default(),
            },
            WireBlock::ToolResult { tool_use_id, content, is_error } => {
                ContentBlock::ToolResult { tool_use_id, content, is_error }
            }
        }
    }
}

#[derive(Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

impl WireTool {
    fn from_descriptor(d: &ToolDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            description: d.description.clone(),
            input_schema: d.input_schema.clone(),
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    content: Vec<WireBlock>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
}
