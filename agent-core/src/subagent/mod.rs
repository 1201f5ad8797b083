//! Task tool: spawns a recursive Agent loop scoped to a filtered tool set,
//! either synchronously or as a tracked background run.

use crate::agent_loop::{AgentLoop, LlmConfig, StopReason};
use crate::cancel::CancelToken;
use crate::message::{Content, Message};
use crate::tools::{Tool, ToolCallItem, ToolContext, ToolError, ToolRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Static catalog entry describing one spawnable agent type.
#[derive(Clone)]
pub struct AgentTypeDescriptor {
    pub name: String,
    pub when_to_use: String,
    /// `None` means "*" — every registered tool is eligible.
    pub allowed_tools: Option<Vec<String>>,
    pub disallowed_tools: Vec<String>,
    pub system_prompt: String,
    pub default_model: String,
}

/// Read-only after startup, per the corpus's singleton-services convention.
#[derive(Clone, Default)]
pub struct AgentCatalog {
    types: HashMap<String, AgentTypeDescriptor>,
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: AgentTypeDescriptor) {
        self.types.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&AgentTypeDescriptor> {
        self.types.get(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackgroundState {
    Running,
    Completed,
    Failed,
    Killed,
}

/// In-memory record for a background sub-agent run.
pub struct BackgroundTask {
    pub id: String,
    pub agent_type: String,
    pub description: String,
    pub prompt: String,
    pub state: Mutex<BackgroundState>,
    pub started_at: Instant,
    pub ended_at: Mutex<Option<Instant>>,
    pub result: Mutex<Option<String>>,
    pub error: Mutex<Option<String>>,
    pub cancel: CancelToken,
    notify: tokio::sync::Notify,
}

impl BackgroundTask {
    fn snapshot_state(&self) -> BackgroundState {
        self.state.lock().unwrap().clone()
    }
}

/// Registry of background sub-agent runs. Completed entries are evicted after
/// a bounded TTL (see the "background-sub-agent cleanup policy" open
/// question) rather than kept forever.
pub struct BackgroundTaskRegistry {
    tasks: Mutex<HashMap<String, Arc<BackgroundTask>>>,
    ttl: Duration,
}

impl BackgroundTaskRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self { tasks: Mutex::new(HashMap::new()), ttl }
    }

    fn insert(&self, task: Arc<BackgroundTask>) {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
    }

    pub fn get(&self, id: &str) -> Option<Arc<BackgroundTask>> {
        self.tasks.lock().unwrap().get(id).cloned()
    }

    /// Drops any completed/failed/killed entry older than the TTL. Call
    /// periodically; a single-threaded sweep is enough since this is an
    /// in-memory, best-effort cleanup, not a correctness requirement.
    pub fn evict_expired(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|_, t| {
            let state = t.snapshot_state();
            if state == BackgroundState::Running {
                return true;
            }
            match *t.ended_at.lock().unwrap() {
                Some(ended) => ended.elapsed() < self.ttl,
                None => true,
            }
        });
    }
}

pub enum TaskOutputResult {
    Success { result: Option<String>, error: Option<String> },
    Timeout,
    NotFound,
}

/// Tool wired for `{ agentType, description, prompt, background? }`.
pub struct TaskTool {
    catalog: Arc<AgentCatalog>,
    registry: Arc<ToolRegistry>,
    background: Arc<BackgroundTaskRegistry>,
}

impl TaskTool {
    pub fn new(catalog: Arc<AgentCatalog>, registry: Arc<ToolRegistry>, background: Arc<BackgroundTaskRegistry>) -> Self {
        Self { catalog, registry, background }
    }

    fn filtered_registry(&self, descriptor: &AgentTypeDescriptor) -> Arc<ToolRegistry> {
        Arc::new(self.registry.filtered(descriptor.allowed_tools.as_deref(), &descriptor.disallowed_tools))
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn is_read_only(&self, _input: &serde_json::Value) -> bool {
        false
    }
    fn is_concurrency_safe(&self, _input: &serde_json::Value) -> bool {
        false
    }

    async fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
        emit: Arc<dyn Fn(ToolCallItem) + Send + Sync>,
    ) -> Result<(), ToolError> {
        let agent_type = input
            .get("agentType")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::Validation("agentType is required".into()))?;
        let prompt = input
            .get("prompt")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::Validation("prompt is required".into()))?
            .to_string();
        let description = input.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let background = input.get("background").and_then(|v| v.as_bool()).unwrap_or(false);

        let descriptor = self
            .catalog
            .get(agent_type)
            .ok_or_else(|| ToolError::Validation(format!("unknown agent type: {agent_type}")))?
            .clone();

        let llm_config = ctx
            .llm_config
            .clone()
            .ok_or_else(|| ToolError::Execution("no llm config available for sub-agent".into()))?;
        let mut sub_config = (*llm_config).clone();
        if sub_config.model.is_empty() {
            sub_config.model = descriptor.default_model.clone();
        }
        sub_config.system_prompt = Some(descriptor.system_prompt.clone());

        let sub_registry = self.filtered_registry(&descriptor);
        let cancel = ctx.cancel.child();
        let cwd = ctx.cwd.clone();
        let initial = vec![Message::user(Content::Text(prompt.clone()))];

        if !background {
            let agent = AgentLoop::new(sub_config, sub_registry);
            let outcome = agent
                .run(initial, cwd, cancel)
                .await
                .map_err(|e| ToolError::Execution(e.to_string()))?;
            let text = last_text(&outcome.messages);
            emit(ToolCallItem::Result {
                data: serde_json::json!({ "text": text, "stopReason": format!("{:?}", outcome.stop_reason) }),
                result_for_assistant: Some(text),
                is_error: false,
            });
            return Ok(());
        }

        let id = short_id();
        let task = Arc::new(BackgroundTask {
            id: id.clone(),
            agent_type: agent_type.to_string(),
            description,
            prompt,
            state: Mutex::new(BackgroundState::Running),
            started_at: Instant::now(),
            ended_at: Mutex::new(None),
            result: Mutex::new(None),
            error: Mutex::new(None),
            cancel: cancel.clone(),
            notify: tokio::sync::Notify::new(),
        });
        self.background.insert(task.clone());

        tokio::spawn(async move {
            let agent = AgentLoop::new(sub_config, sub_registry);
            let run = agent.run(initial, cwd, cancel).await;
            let mut state = task.state.lock().unwrap();
            match run {
                Ok(outcome) if outcome.stop_reason == StopReason::Cancelled => {
                    *state = BackgroundState::Killed;
                }
                Ok(outcome) => {
                    *task.result.lock().unwrap() = Some(last_text(&outcome.messages));
                    *state = BackgroundState::Completed;
                }
                Err(e) => {
                    *task.error.lock().unwrap() = Some(e.to_string());
                    *state = BackgroundState::Failed;
                }
            }
            drop(state);
            *task.ended_at.lock().unwrap() = Some(Instant::now());
            task.notify.notify_waiters();
        });

        emit(ToolCallItem::Result {
            data: serde_json::json!({ "taskId": id }),
            result_for_assistant: Some(format!("started background task {id}")),
            is_error: false,
        });
        Ok(())
    }
}

/// Companion tool: `TaskOutput(id, block?, timeout?)`.
pub struct TaskOutputTool {
    background: Arc<BackgroundTaskRegistry>,
}

impl TaskOutputTool {
    pub fn new(background: Arc<BackgroundTaskRegistry>) -> Self {
        Self { background }
    }

    pub async fn query(&self, id: &str, block: bool, timeout: Option<Duration>) -> TaskOutputResult {
        let Some(task) = self.background.get(id) else {
            return TaskOutputResult::NotFound;
        };

        if !block || task.snapshot_state() != BackgroundState::Running {
            return snapshot(&task);
        }

        let wait = task.notify.notified();
        match timeout {
            Some(d) => {
                if tokio::time::timeout(d, wait).await.is_err() {
                    return TaskOutputResult::Timeout;
                }
            }
            None => wait.await,
        }
        snapshot(&task)
    }
}

fn snapshot(task: &BackgroundTask) -> TaskOutputResult {
    TaskOutputResult::Success {
        result: task.result.lock().unwrap().clone(),
        error: task.error.lock().unwrap().clone(),
    }
}

#[async_trait]
impl Tool for TaskOutputTool {
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
        let id = input
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::Validation("id is required".into()))?;
        let block = input.get("block").and_then(|v| v.as_bool()).unwrap_or(false);
        let timeout = input
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis);

        let (status, data) = match self.query(id, block, timeout).await {
            TaskOutputResult::Success { result, error } => {
                ("success", serde_json::json!({ "result": result, "error": error }))
            }
            TaskOutputResult::Timeout => ("timeout", serde_json::json!({})),
            TaskOutputResult::NotFound => ("not_found", serde_json::json!({})),
        };

        emit(ToolCallItem::Result {
            data: serde_json::json!({ "status": status, "data": data }),
            result_for_assistant: Some(status.to_string()),
            is_error: false,
        });
        Ok(())
    }
}

fn last_text(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find_map(|m| match m {
            Message::Assistant { content, .. } => {
                let text = content
                    .blocks()
                    .into_iter()
                    .filter_map(|b| match b {
                        crate::message::ContentBlock::Text { text } => Some(text),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                if text.is_empty() { None } else { Some(text) }
            }
            _ => None,
        })
        .unwrap_or_default()
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with(name: &str) -> Arc<AgentCatalog> {
        let mut catalog = AgentCatalog::new();
        catalog.register(AgentTypeDescriptor {
            name: name.to_string(),
            when_to_use: "testing".to_string(),
            allowed_tools: None,
            disallowed_tools: vec![],
            system_prompt: "you are a test agent".to_string(),
            default_model: "test-model".to_string(),
        });
        Arc::new(catalog)
    }

    #[test]
    fn catalog_lookup_roundtrips() {
        let catalog = catalog_with("explorer");
        assert!(catalog.get("explorer").is_some());
        assert!(catalog.get("missing").is_none());
    }

    #[tokio::test]
    async fn task_output_reports_not_found_for_unknown_id() {
        let background = Arc::new(BackgroundTaskRegistry::new(Duration::from_secs(60)));
        let tool = TaskOutputTool::new(background);
        let result = tool.query("nope", false, None).await;
        assert!(matches!(result, TaskOutputResult::NotFound));
    }

    #[tokio::test]
    async fn blocking_query_times_out_while_task_runs() {
        let background = Arc::new(BackgroundTaskRegistry::new(Duration::from_secs(60)));
        let task = Arc::new(BackgroundTask {
            id: "t1".to_string(),
            agent_type: "explorer".to_string(),
            description: String::new(),
            prompt: String::new(),
            state: Mutex::new(BackgroundState::Running),
            started_at: Instant::now(),
            ended_at: Mutex::new(None),
            result: Mutex::new(None),
            error: Mutex::new(None),
            cancel: CancelToken::new(),
            notify: tokio::sync::Notify::new(),
        });
        background.insert(task);
        let tool = TaskOutputTool::new(background);
        let result = tool.query("t1", true, Some(Duration::from_millis(20))).await;
        assert!(matches!(result, TaskOutputResult::Timeout));
    }

    #[test]
    fn eviction_keeps_running_and_recent_completed_tasks() {
        let registry = BackgroundTaskRegistry::new(Duration::from_millis(10));
        let running = Arc::new(BackgroundTask {
            id: "running".to_string(),
            agent_type: String::new(),
            description: String::new(),
            prompt: String::new(),
            state: Mutex::new(BackgroundState::Running),
            started_at: Instant::now(),
            ended_at: Mutex::new(None),
            result: Mutex::new(None),
            error: Mutex::new(None),
            cancel: CancelToken::new(),
            notify: tokio::sync::Notify::new(),
        });
        registry.insert(running);
        let stale = Arc::new(BackgroundTask {
            id: "stale".to_string(),
            agent_type: String::new(),
            description: String::new(),
            prompt: String::new(),
            state: Mutex::new(BackgroundState::Completed),
            started_at: Instant::now(),
            ended_at: Mutex::new(Some(Instant::now() - Duration::from_secs(1))),
            result: Mutex::new(None),
            error: Mutex::new(None),
            cancel: CancelToken::new(),
            notify: tokio::sync::Notify::new(),
        });
        registry.insert(stale);

        registry.evict_expired();
        assert!(registry.get("running").is_some());
        assert!(registry.get("stale").is_none());
    }
}
