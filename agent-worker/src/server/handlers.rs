//! Request dispatch by `type`, per the worker protocol.

use super::state::ServerState;
use crate::ipc::Request;
use crate::output_buffer::{ChunkAttrs, ChunkType};
use crate::store::{SessionStatus, StoreError, TaskStatus};
use agent_core::agent_loop::{AgentLoop, Hooks, LlmConfig};
use agent_core::message::{Content, Message};
use agent_core::{CancelToken, ContentBlock};
use serde_json::{json, Value};
use std::sync::Arc;

/// Dispatches one request and reports whether it should trigger shutdown
/// after the response is sent. Every handler error is converted here into
/// `success:false` — nothing in this path panics on bad input.
pub async fn dispatch(state: &Arc<ServerState>, req: Request) -> (bool, Value, Option<String>, bool) {
    let is_shutdown = req.kind == "shutdown";
    let result = match req.kind.as_str() {
        "ping" => Ok(json!({"ok": true})),
        "session_create" => handle_session_create(state, req.payload).await,
        "session_get" => handle_session_get(state, req.payload).await,
        "session_list" => handle_session_list(state, req.payload).await,
        "session_delete" => handle_session_delete(state, req.payload).await,
        "task_get" => handle_task_get(state, req.payload).await,
        "task_list" => handle_task_list(state, req.payload).await,
        "execute" => handle_execute(state, req.payload).await,
        "get_status" => handle_get_status(state, req.payload).await,
        "get_output" => handle_get_output(state, req.payload).await,
        "cancel" => handle_cancel(state, req.payload).await,
        "shutdown" => Ok(json!({"message": "shutting down"})),
        other => Err(format!("unknown request type: {other}")),
    };

    match result {
        Ok(data) => (true, data, None, is_shutdown),
        Err(e) => (false, Value::Null, Some(e), false),
    }
}

fn payload_err(field: &str) -> String {
    format!("missing or invalid field: {field}")
}

fn store_err(e: StoreError) -> String {
    e.to_string()
}

async fn handle_session_create(state: &Arc<ServerState>, payload: Option<Value>) -> Result<Value, String> {
    let payload = payload.ok_or_else(|| payload_err("payload"))?;
    let project_root = payload.get("projectRoot").and_then(|v| v.as_str()).ok_or_else(|| payload_err("projectRoot"))?;
    let model = payload.get("model").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let metadata = payload.get("metadata").map(|v| v.to_string());
    let session = state.store.create_session(project_root.to_string(), model, metadata).await.map_err(store_err)?;
    Ok(serde_json::to_value(session).unwrap())
}

async fn handle_session_get(state: &Arc<ServerState>, payload: Option<Value>) -> Result<Value, String> {
    let id = id_field(&payload, "sessionId")?;
    let session = state.store.get_session(&id).await.map_err(store_err)?;
    Ok(serde_json::to_value(session).unwrap())
}

async fn handle_session_list(state: &Arc<ServerState>, _payload: Option<Value>) -> Result<Value, String> {
    let sessions = state.store.list_sessions(None).await.map_err(store_err)?;
    Ok(serde_json::to_value(sessions).unwrap())
}

async fn handle_session_delete(state: &Arc<ServerState>, payload: Option<Value>) -> Result<Value, String> {
    let id = id_field(&payload, "sessionId")?;
    state.store.delete_session(&id).await.map_err(store_err)?;
    Ok(json!({"deleted": true}))
}

async fn handle_task_get(state: &Arc<ServerState>, payload: Option<Value>) -> Result<Value, String> {
    let id = id_field(&payload, "taskId")?;
    let task = state.store.get_task(&id).await.map_err(store_err)?;
    Ok(serde_json::to_value(task).unwrap())
}

async fn handle_task_list(state: &Arc<ServerState>, payload: Option<Value>) -> Result<Value, String> {
    let session_id = id_field(&payload, "sessionId")?;
    let tasks = state.store.list_tasks_for_session(&session_id).await.map_err(store_err)?;
    Ok(serde_json::to_value(tasks).unwrap())
}

fn id_field(payload: &Option<Value>, field: &str) -> Result<String, String> {
    payload
        .as_ref()
        .and_then(|p| p.get(field))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| payload_err(field))
}

async fn handle_execute(state: &Arc<ServerState>, payload: Option<Value>) -> Result<Value, String> {
    let payload = payload.ok_or_else(|| payload_err("payload"))?;
    let prompt = payload.get("prompt").and_then(|v| v.as_str()).ok_or_else(|| payload_err("prompt"))?.to_string();
    let model = payload.get("model").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let project_root = payload.get("projectRoot").and_then(|v| v.as_str()).unwrap_or(".").to_string();
    let system_prompt = payload.get("systemPrompt").and_then(|v| v.as_str()).map(|s| s.to_string());
    let base_url = payload.get("baseUrl").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let api_key = payload.get("apiKey").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let thinking_budget = payload.get("thinkingBudget").and_then(|v| v.as_u64()).map(|v| v as u32);
    let dialect = payload.get("dialect").and_then(|v| v.as_str()).and_then(|s| match s {
        "claude" => Some(agent_core::provider::Dialect::Claude),
        "chat_completions" => Some(agent_core::provider::Dialect::ChatCompletions),
        _ => None,
    });
    let existing_session = payload.get("sessionId").and_then(|v| v.as_str()).map(|s| s.to_string());

    let session = match existing_session {
        Some(id) => state.store.get_session(&id).await.map_err(store_err)?,
        None => state.store.create_session(project_root.clone(), model.clone(), None).await.map_err(store_err)?,
    };

    let task = state.store.create_task(session.id.clone(), "execute".to_string(), prompt.clone()).await.map_err(store_err)?;
    state.store.mark_task_running(&task.id).await.map_err(store_err)?;

    let buffer = state.buffers.get_or_create(&task.id);
    let cancel = CancelToken::new();
    state.register_running(&task.id, cancel.clone());

    let mut config = LlmConfig::new(model, base_url, api_key);
    config.system_prompt = system_prompt;
    config.thinking_budget = thinking_budget;
    config.dialect = dialect;

    let hooks_buffer = buffer.clone();
    let hooks = Hooks {
        on_llm_response: Some(Arc::new({
            let buffer = hooks_buffer.clone();
            move |resp: agent_core::provider::CompletionResponse| {
                for block in &resp.content {
                    append_block(&buffer, block, false);
                }
            }
        })),
        on_tool_progress: Some(Arc::new({
            let buffer = hooks_buffer.clone();
            move |item| {
                if let agent_core::tools::ToolCallItem::Progress { content } = item {
                    buffer.append(ChunkType::Text, content, ChunkAttrs { is_progress: Some(true), ..Default::default() });
                }
            }
        })),
        ..Default::default()
    };

    let registry = state.registry.clone();
    let store = state.store.clone();
    let state_for_task = state.clone();
    let task_id = task.id.clone();
    let cwd = std::path::PathBuf::from(project_root);

    tokio::spawn(async move {
        let agent = AgentLoop::new(config, registry).with_hooks(hooks);
        let initial = vec![Message::user(Content::Text(prompt))];
        let outcome = agent.run(initial, cwd, cancel).await;

        let status = match &outcome {
            Ok(o) if o.stop_reason == agent_core::agent_loop::StopReason::Cancelled => TaskStatus::Cancelled,
            Ok(_) => TaskStatus::Completed,
            Err(_) => TaskStatus::Failed,
        };
        let (result, error) = match outcome {
            Ok(o) => (Some(last_assistant_text(&o.messages)), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let _ = store.complete_task(&task_id, result, error, status).await;
        let session_status = match status {
            TaskStatus::Completed => SessionStatus::Completed,
            TaskStatus::Failed => SessionStatus::Failed,
            TaskStatus::Cancelled => SessionStatus::Cancelled,
            _ => SessionStatus::Active,
        };
        let _ = store.update_session_status(&session.id, session_status).await;
        state_for_task.buffers.mark_completed(&task_id);
        state_for_task.finish_running(&task_id);
    });

    Ok(json!({
        "taskId": task.id,
        "sessionId": session.id,
        "status": "running",
        "outputCount": 0,
        "startedAt": chrono::Utc::now().to_rfc3339(),
    }))
}

fn append_block(buffer: &crate::output_buffer::OutputBuffer, block: &ContentBlock, is_progress: bool) {
    match block {
        ContentBlock::Text { text } => {
            buffer.append(ChunkType::Text, text.clone(), ChunkAttrs { is_progress: Some(is_progress), ..Default::default() });
        }
        ContentBlock::Thinking { thinking } => {
            buffer.append(ChunkType::Thinking, thinking.clone(), ChunkAttrs { is_progress: Some(is_progress), ..Default::default() });
        }
        ContentBlock::ToolUse { id, name, input } => {
            buffer.append(
                ChunkType::ToolUse,
                serde_json::to_string(input).unwrap_or_default(),
                ChunkAttrs { tool_id: Some(id.clone()), tool_name: Some(name.clone()), ..Default::default() },
            );
        }
        ContentBlock::ToolResult { tool_use_id, content, is_error } => {
            buffer.append(
                ChunkType::ToolResult,
                content.clone(),
                ChunkAttrs { tool_id: Some(tool_use_id.clone()), is_error: Some(*is_error), ..Default::default() },
            );
        }
    }
}

fn last_assistant_text(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find_map(|m| match m {
            Message::Assistant { content, .. } => Some(
                content
                    .blocks()
                    .into_iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        })
        .unwrap_or_default()
}

async fn handle_get_status(state: &Arc<ServerState>, payload: Option<Value>) -> Result<Value, String> {
    let id = id_field(&payload, "taskId")?;
    if let Some(running) = state.running_task(&id) {
        let live = running.live_status.lock().unwrap().clone();
        return Ok(json!({"taskId": id, "status": live.status, "outputCount": live.output_count}));
    }
    let task = state.store.get_task(&id).await.map_err(store_err)?;
    Ok(serde_json::to_value(task).unwrap())
}

async fn handle_get_output(state: &Arc<ServerState>, payload: Option<Value>) -> Result<Value, String> {
    let id = id_field(&payload, "taskId")?;
    let from_id = payload.as_ref().and_then(|p| p.get("fromId")).and_then(|v| v.as_u64());
    let buffer = state.buffers.get(&id).ok_or_else(|| format!("no output buffer for task {id}"))?;
    let chunks = buffer.get_chunks(from_id);
    let running = state.running_task(&id).is_some();
    Ok(json!({
        "chunks": chunks,
        "hasMore": running,
        "status": if running { "running" } else { "completed" },
    }))
}

async fn handle_cancel(state: &Arc<ServerState>, payload: Option<Value>) -> Result<Value, String> {
    let id = id_field(&payload, "taskId")?;
    if let Some(running) = state.running_task(&id) {
        running.cancel.cancel();
    }
    state.store.complete_task(&id, None, None, TaskStatus::Cancelled).await.map_err(store_err)?;
    Ok(json!({"cancelled": true}))
}
