//! Generic OpenAI-style chat-completions dialect.

use super::{with_retry, CompletionRequest, CompletionResponse, FinishReason, ProviderAdapter, ProviderError};
use crate::message::{ContentBlock, Message, Usage};
use crate::tools::ToolDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const MAX_ATTEMPTS: u32 = 3;

pub struct ChatCompletionsAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ChatCompletionsAdapter {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    fn to_wire_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<WireMessage> {
        let mut out = Vec::new();
        if let Some(s) = system_prompt {
            out.push(WireMessage {
                role: "system".to_string(),
                content: Some(s.to_string()),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        for m in messages {
            match m {
                Message::User { content, .. } => {
                    let blocks = content.blocks();
                    let tool_results: Vec<&ContentBlock> = blocks
                        .iter()
                        .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
                        .collect();
                    if !tool_results.is_empty() {
                        for b in tool_results {
                            if let ContentBlock::ToolResult { tool_use_id, content, .. } = b {
                                out.push(WireMessage {
                                    role: "tool".to_string(),
                                    content: Some(content.clone()),
                                    tool_calls: None,
                                    tool_call_id: Some(tool_use_id.clone()),
                                });
                            }
                        }
                    } else {
                        let text = blocks
                            .iter()
                            .filter_map(|b| match b {
                                ContentBlock::Text { text } => Some(text.clone()),
                                _ => None,
                            })
                            .collect::<Vec<_>>()
                            .join("\n");
                        out.push(WireMessage {
                            role: "user".to_string(),
                            content: Some(text),
                            tool_calls: None,
                            tool_call_id: None,
                        });
                    }
                }
                Message::Assistant { content, .. } => {
                    let blocks = content.blocks();
                    let text = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => Some(text.clone()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    let tool_calls: Vec<WireToolCall> = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::ToolUse { id, name, input } => Some(WireToolCall {
                                id: id.clone(),
                                r#type: "function".to_string(),
                                function: WireFunctionCall {
                                    name: name.clone(),
                                    arguments: serde_json::to_string(input).unwrap_or_default(),
                                },
                            }),
                            _ => None,
                        })
                        .collect();
                    out.push(WireMessage {
                        role: "assistant".to_string(),
                        content: if text.is_empty() { None } else { Some(text) },
                        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                        tool_call_id: None,
                    });
                }
                Message::Progress { .. } => {}
            }
        }
        out
    }
}

#[async_trait]
impl ProviderAdapter for ChatCompletionsAdapter {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &crate::cancel::CancelToken,
    ) -> Result<CompletionResponse, ProviderError> {
        let wire_messages = Self::to_wire_messages(request.system_prompt.as_deref(), &request.messages);
        let tools: Vec<WireTool> = request.tools.iter().map(WireTool::from_descriptor).collect();

        let body = WireRequest {
            model: request.model.clone(),
            messages: wire_messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
        };

        with_retry(MAX_ATTEMPTS, || async {
            let send = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("content-type", "application/json")
                .bearer_auth(&self.api_key)
                .json(&body)
                .send();

            let response = tokio::select! {
                r = send => r.map_err(|e| ProviderError::Network(e.to_string()))?,
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            };

            let status = response.status();
            if status.as_u16() == 429 {
                return Err(ProviderError::RateLimited { retry_after_ms: None });
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

            let choice = wire
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::Malformed("no choices in response".to_string()))?;

            let mut content = Vec::new();
            if let Some(text) = choice.message.content {
                if !text.is_empty() {
                    content.push(ContentBlock::Text { text });
                }
            }
            for tc in choice.message.tool_calls.unwrap_or_default() {
                let input = serde_json::from_str::<serde_json::Value>(&tc.function.arguments)
                    .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));
                content.push(ContentBlock::ToolUse {
                    id: tc.id,
                    name: tc.function.name,
                    input: input.as_object().cloned().unwrap_or_default(),
                });
            }

            let finish_reason = match choice.finish_reason.as_deref() {
                Some("tool_calls") => FinishReason::ToolUse,
                Some("length") => FinishReason::Length,
                Some("stop") | None => FinishReason::Stop,
                _ => FinishReason::Stop,
            };

            Ok(CompletionResponse {
                content,
                usage: wire.usage.map(|u| Usage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
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
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "tool_call_id")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    r#type: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    r#type: String,
    function: WireFunctionDef,
}

#[derive(Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl WireTool {
    fn from_descriptor(d: &ToolDescriptor) -> Self {
        Self {
            r#type: "function".to_string(),
            function: WireFunctionDef {
                name: d.name.clone(),
                description: d.description.clone(),
                parameters: d.input_schema.clone(),
            },
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
