//! Uniform tool interface: validate, call-as-lazy-sequence, render.
//!
//! "Tool" is polymorphic over (input type, output type); the executor needs a
//! uniform type, so we erase at the boundary with a single `call` entry
//! point accepting `serde_json::Value` and returning a stream of typed
//! items, with the typed definition (if any) kept private to each tool's
//! own module.

pub mod executor;
pub mod registry;

pub use executor::{ExecutorError, ToolExecutor};
pub use registry::ToolRegistry;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

/// One item from a tool's call sequence. A call yields zero or more
/// `Progress`/`StreamingOutput` items followed by exactly one `Result`.
#[derive(Clone, Debug)]
pub enum ToolCallItem {
    Progress { content: String },
    StreamingOutput { line: String },
    Result {
        data: serde_json::Value,
        /// Pre-rendered assistant-visible text, if the tool wants to override
        /// the descriptor's default renderer.
        result_for_assistant: Option<String>,
        is_error: bool,
    },
}

#[derive(Debug, Error, Clone)]
pub enum ToolError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("tool produced no terminal result")]
    NoTerminalResult,
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("cancelled")]
    Cancelled,
}

/// Request-scoped record passed into each call.
#[derive(Clone)]
pub struct ToolContext {
    pub cancel: crate::cancel::CancelToken,
    pub cwd: std::path::PathBuf,
    /// Read-before-write guard: last successful read timestamp per path.
    pub file_read_timestamps: Arc<std::sync::Mutex<HashMap<std::path::PathBuf, SystemTime>>>,
    /// LLM config for sub-agents spawned from this context.
    pub llm_config: Option<Arc<crate::agent_loop::LlmConfig>>,
    pub stream_sink: Option<Arc<dyn Fn(ToolCallItem) + Send + Sync>>,
}

impl ToolContext {
    pub fn new(cwd: std::path::PathBuf, cancel: crate::cancel::CancelToken) -> Self {
        Self {
            cancel,
            cwd,
            file_read_timestamps: Arc::new(std::sync::Mutex::new(HashMap::new())),
            llm_config: None,
            stream_sink: None,
        }
    }

    pub fn note_read(&self, path: &std::path::Path) {
        if let Ok(mut m) = self.file_read_timestamps.lock() {
            m.insert(path.to_path_buf(), SystemTime::now());
        }
    }

    pub fn last_read(&self, path: &std::path::Path) -> Option<SystemTime> {
        self.file_read_timestamps.lock().ok().and_then(|m| m.get(path).copied())
    }
}

/// Immutable, registry-facing description of a tool.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub tool: Arc<dyn Tool>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor").field("name", &self.name).finish()
    }
}

/// The typed behavior every tool implementation supplies. Erased into
/// `ToolDescriptor` for storage in a [`ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn is_read_only(&self, input: &serde_json::Value) -> bool;
    fn is_concurrency_safe(&self, input: &serde_json::Value) -> bool;

    /// Optional extra validation beyond the structural schema check.
    fn validate_input(&self, _input: &serde_json::Value, _ctx: &ToolContext) -> Result<(), ToolError> {
        Ok(())
    }

    /// Runs the tool, emitting each item through `emit` as it becomes
    /// available. Must emit exactly one `ToolCallItem::Result` before
    /// returning; the executor treats a call that returns without one as
    /// [`ToolError::NoTerminalResult`].
    async fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
        emit: Arc<dyn Fn(ToolCallItem) + Send + Sync>,
    ) -> Result<(), ToolError>;

    /// Renders a successful structured result into the assistant-visible
    /// string, when the tool itself did not supply `result_for_assistant`.
    fn render(&self, data: &serde_json::Value) -> String {
        data.to_string()
    }
}

/// Structurally validates `input` against `schema`. A minimal, dependency-free
/// check covering `type`, `required`, and `properties` — the shapes tool
/// schemas in practice actually use.
pub fn validate_schema(input: &serde_json::Value, schema: &serde_json::Value) -> Result<(), ToolError> {
    let obj_schema = schema.as_object();
    if let Some(s) = obj_schema {
        if s.get("type").and_then(|t| t.as_str()) == Some("object") && !input.is_object() {
            return Err(ToolError::Validation("expected an object".to_string()));
        }
        if let Some(required) = s.get("required").and_then(|r| r.as_array()) {
            let input_obj = input.as_object();
            for field in required {
                let Some(name) = field.as_str() else { continue };
                let present = input_obj.map(|o| o.contains_key(name)).unwrap_or(false);
                if !present {
                    return Err(ToolError::Validation(format!("missing required field '{name}'")));
                }
            }
        }
    }
    Ok(())
}
