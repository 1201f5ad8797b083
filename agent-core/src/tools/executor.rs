//! Runs one assistant turn's tool_use queue to completion.
//!
//! Entries are grouped into maximal runs of consecutive read-only,
//! concurrency-safe calls; each such run executes in parallel (one
//! `tokio::spawn` per entry, joined by queue position). Any entry that is not both read-only and
//! concurrency-safe runs alone, serialized against its neighbors. Output
//! order always matches input order regardless of completion order.

use super::{ToolCallItem, ToolContext, ToolDescriptor, ToolError, ToolRegistry};
use crate::cancel::CancelToken;
use crate::message::{Content, ContentBlock, Message};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("empty tool_use queue")]
    EmptyQueue,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

/// One entry in the tool_use queue: its position, the source block, and the
/// resolved descriptor (`None` for an unknown tool name).
struct QueueEntry {
    index: usize,
    id: String,
    name: String,
    input: serde_json::Value,
    descriptor: Option<ToolDescriptor>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Executes every tool_use block in `tool_uses`, returning a single
    /// synthetic user message carrying one `tool_result` per input block, in
    /// input order. Never returns an `Err` for a single tool's failure — only
    /// for a structurally empty queue; per-tool failures become `is_error`
    /// results instead.
    pub async fn run(
        &self,
        tool_uses: &[ContentBlock],
        ctx: &ToolContext,
    ) -> Result<Message, ExecutorError> {
        if tool_uses.is_empty() {
            return Err(ExecutorError::EmptyQueue);
        }

        let queue: Vec<QueueEntry> = tool_uses
            .iter()
            .enumerate()
            .filter_map(|(index, block)| match block {
                ContentBlock::ToolUse { id, name, input } => Some(QueueEntry {
                    index,
                    id: id.clone(),
                    name: name.clone(),
                    input: serde_json::Value::Object(input.clone()),
                    descriptor: self.registry.get(name).cloned(),
                }),
                _ => None,
            })
            .collect();

        let mut results: Vec<Option<ContentBlock>> = vec![None; tool_uses.len()];

        // Pre-flight: unknown tools and failed validation resolve immediately
        // and are excluded from the run partitioning below.
        let mut runnable: Vec<QueueEntry> = Vec::new();
        for entry in queue {
            match &entry.descriptor {
                None => {
                    results[entry.index] = Some(error_result(
                        &entry.id,
                        format!("unknown tool: {}", entry.name),
                    ));
                }
                Some(descriptor) => {
                    if let Err(e) = super::validate_schema(&entry.input, &descriptor.input_schema) {
                        results[entry.index] = Some(error_result(&entry.id, e.to_string()));
                        continue;
                    }
                    if let Err(e) = descriptor.tool.validate_input(&entry.input, ctx) {
                        results[entry.index] = Some(error_result(&entry.id, e.to_string()));
                        continue;
                    }
                    runnable.push(entry);
                }
            }
        }

        for run in partition_into_runs(runnable, &ctx.cancel) {
            if ctx.cancel.is_cancelled() {
                break;
            }
            match run {
                Run::Concurrent(entries) => {
                    let handles: Vec<_> = entries
                        .into_iter()
                        .map(|entry| {
                            let ctx = ctx.clone();
                            tokio::spawn(async move { (entry.index, entry.id.clone(), run_one(entry, ctx).await) })
                        })
                        .collect();
                    for handle in handles {
                        match handle.await {
                            Ok((index, _id, block)) => results[index] = Some(block),
                            Err(join_err) => {
                                // Task panicked or was cancelled by the runtime; we don't
                                // know its index here, so this can't happen without losing
                                // slot information — guard against it defensively by logging.
                                tracing::error!(error = %join_err, "tool task join failed");
                            }
                        }
                    }
                }
                Run::Serial(entry) => {
                    let index = entry.index;
                    let block = run_one(entry, ctx.clone()).await;
                    results[index] = Some(block);
                }
            }
        }

        let blocks: Vec<ContentBlock> = results
            .into_iter()
            .enumerate()
            .filter_map(|(_, b)| b)
            .collect();

        Ok(Message::user(Content::Blocks(blocks)))
    }
}

enum Run {
    Concurrent(Vec<QueueEntry>),
    Serial(QueueEntry),
}

fn is_safe(entry: &QueueEntry) -> bool {
    match &entry.descriptor {
        Some(d) => d.tool.is_read_only(&entry.input) && d.tool.is_concurrency_safe(&entry.input),
        None => false,
    }
}

/// Splits `entries` (already filtered to runnable-only) into maximal
/// consecutive groups of safe entries, with unsafe entries as singleton
/// serial runs in between.
fn partition_into_runs(entries: Vec<QueueEntry>, _cancel: &CancelToken) -> Vec<Run> {
    let mut runs = Vec::new();
    let mut pending_safe: Vec<QueueEntry> = Vec::new();

    for entry in entries {
        if is_safe(&entry) {
            pending_safe.push(entry);
        } else {
            if !pending_safe.is_empty() {
                runs.push(Run::Concurrent(std::mem::take(&mut pending_safe)));
            }
            runs.push(Run::Serial(entry));
        }
    }
    if !pending_safe.is_empty() {
        runs.push(Run::Concurrent(pending_safe));
    }
    runs
}

async fn run_one(entry: QueueEntry, ctx: ToolContext) -> ContentBlock {
    let Some(descriptor) = entry.descriptor else {
        return error_result(&entry.id, format!("unknown tool: {}", entry.name));
    };

    if ctx.cancel.is_cancelled() {
        return error_result(&entry.id, ToolError::Cancelled.to_string());
    }

    let terminal: Arc<std::sync::Mutex<Option<(serde_json::Value, Option<String>, bool)>>> =
        Arc::new(std::sync::Mutex::new(None));
    let terminal_for_emit = terminal.clone();
    let sink = ctx.stream_sink.clone();
    let emit: Arc<dyn Fn(ToolCallItem) + Send + Sync> = Arc::new(move |item: ToolCallItem| {
        if let Some(sink) = &sink {
            sink(item.clone());
        }
        if let ToolCallItem::Result { data, result_for_assistant, is_error } = item {
            *terminal_for_emit.lock().unwrap() = Some((data, result_for_assistant, is_error));
        }
    });

    let call_result = descriptor.tool.call(entry.input, ctx, emit).await;

    if let Err(e) = call_result {
        return error_result(&entry.id, e.to_string());
    }

    let terminal = terminal.lock().unwrap().take();
    match terminal {
        Some((data, result_for_assistant, is_error)) => {
            let text = result_for_assistant.unwrap_or_else(|| descriptor.render(&data));
            ContentBlock::tool_result(entry.id, text, is_error)
        }
        None => error_result(&entry.id, ToolError::NoTerminalResult.to_string()),
    }
}

fn error_result(tool_use_id: &str, message: String) -> ContentBlock {
    ContentBlock::tool_result(tool_use_id.to_string(), message, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, ToolContext};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowEcho {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for SlowEcho {
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
            tokio::time::sleep(Duration::from_millis(10)).await;
            emit(ToolCallItem::Result { data: input, result_for_assistant: None, is_error: false });
            Ok(())
        }
    }

    struct ExclusiveCounter {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for ExclusiveCounter {
        fn is_read_only(&self, _input: &serde_json::Value) -> bool {
            false
        }
        fn is_concurrency_safe(&self, _input: &serde_json::Value) -> bool {
            false
        }
        async fn call(
            &self,
            input: serde_json::Value,
            _ctx: ToolContext,
            emit: Arc<dyn Fn(ToolCallItem) + Send + Sync>,
        ) -> Result<(), ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            emit(ToolCallItem::Result { data: input, result_for_assistant: None, is_error: false });
            Ok(())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn is_read_only(&self, _input: &serde_json::Value) -> bool {
            true
        }
        fn is_concurrency_safe(&self, _input: &serde_json::Value) -> bool {
            true
        }
        async fn call(
            &self,
            _input: serde_json::Value,
            _ctx: ToolContext,
            _emit: Arc<dyn Fn(ToolCallItem) + Send + Sync>,
        ) -> Result<(), ToolError> {
            Err(ToolError::Execution("boom".to_string()))
        }
    }

    fn descriptor(name: &str, tool: Arc<dyn Tool>) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: String::new(),
            input_schema: serde_json::json!({"type": "object"}),
            tool,
        }
    }

    fn tool_use(id: &str, name: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input: serde_json::Map::new(),
        }
    }

    fn context() -> ToolContext {
        ToolContext::new(std::path::PathBuf::from("."), CancelToken::new())
    }

    #[tokio::test]
    async fn preserves_output_order_across_parallel_completion() {
        let mut registry = ToolRegistry::new();
        registry.register(descriptor("echo", Arc::new(SlowEcho { calls: Arc::new(AtomicUsize::new(0)) })));
        let executor = ToolExecutor::new(Arc::new(registry));

        let queue = vec![tool_use("1", "echo"), tool_use("2", "echo"), tool_use("3", "echo")];
        let result = executor.run(&queue, &context()).await.unwrap();
        let ids: Vec<String> = result.tool_result_ids();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string(), "3".to_string()]);
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result() {
        let executor = ToolExecutor::new(Arc::new(ToolRegistry::new()));
        let queue = vec![tool_use("1", "nope")];
        let result = executor.run(&queue, &context()).await.unwrap();
        match &result.content().unwrap().blocks()[0] {
            ContentBlock::ToolResult { is_error, content, .. } => {
                assert!(is_error);
                assert!(content.contains("unknown tool"));
            }
            _ => panic!("expected tool_result"),
        }
    }

    #[tokio::test]
    async fn tool_error_becomes_is_error_result_not_executor_error() {
        let mut registry = ToolRegistry::new();
        registry.register(descriptor("fail", Arc::new(FailingTool)));
        let executor = ToolExecutor::new(Arc::new(registry));
        let queue = vec![tool_use("1", "fail")];
        let result = executor.run(&queue, &context()).await.unwrap();
        match &result.content().unwrap().blocks()[0] {
            ContentBlock::ToolResult { is_error, .. } => assert!(is_error),
            _ => panic!("expected tool_result"),
        }
    }

    #[tokio::test]
    async fn non_safe_entries_run_serially_between_safe_runs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(descriptor("echo", Arc::new(SlowEcho { calls: Arc::new(AtomicUsize::new(0)) })));
        registry.register(descriptor("exclusive", Arc::new(ExclusiveCounter { calls: counter.clone() })));
        let executor = ToolExecutor::new(Arc::new(registry));

        let queue = vec![
            tool_use("1", "echo"),
            tool_use("2", "exclusive"),
            tool_use("3", "echo"),
        ];
        let result = executor.run(&queue, &context()).await.unwrap();
        assert_eq!(result.content().unwrap().blocks().len(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
