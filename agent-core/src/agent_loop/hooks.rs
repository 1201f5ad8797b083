//! Lifecycle hook dispatch points. A `Hooks` value is a set of optional
//! callbacks the loop invokes at fixed points in a run; each is independent
//! and a missing callback is simply a no-op.

use crate::message::Message;
use crate::provider::{CompletionRequest, CompletionResponse};
use crate::tools::ToolCallItem;
use std::sync::Arc;

pub type HookFn<T> = Arc<dyn Fn(T) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub on_query_start: Option<HookFn<()>>,
    pub on_llm_request: Option<HookFn<CompletionRequest>>,
    pub on_llm_response: Option<HookFn<CompletionResponse>>,
    pub on_tool_start: Option<HookFn<String>>,
    pub on_tool_progress: Option<HookFn<ToolCallItem>>,
    pub on_tool_complete: Option<HookFn<String>>,
    pub on_error: Option<HookFn<String>>,
    pub on_query_end: Option<HookFn<Vec<Message>>>,
    pub on_abort: Option<HookFn<()>>,
}

impl Hooks {
    pub fn fire_query_start(&self) {
        if let Some(f) = &self.on_query_start {
            f(());
        }
    }
    pub fn fire_llm_request(&self, req: &CompletionRequest) {
        if let Some(f) = &self.on_llm_request {
            f(req.clone());
        }
    }
    pub fn fire_llm_response(&self, resp: &CompletionResponse) {
        if let Some(f) = &self.on_llm_response {
            f(resp.clone());
        }
    }
    pub fn fire_tool_start(&self, name: &str) {
        if let Some(f) = &self.on_tool_start {
            f(name.to_string());
        }
    }
    pub fn fire_tool_progress(&self, item: ToolCallItem) {
        if let Some(f) = &self.on_tool_progress {
            f(item);
        }
    }
    pub fn fire_tool_complete(&self, name: &str) {
        if let Some(f) = &self.on_tool_complete {
            f(name.to_string());
        }
    }
    pub fn fire_error(&self, message: &str) {
        if let Some(f) = &self.on_error {
            f(message.to_string());
        }
    }
    pub fn fire_query_end(&self, messages: &[Message]) {
        if let Some(f) = &self.on_query_end {
            f(messages.to_vec());
        }
    }
    pub fn fire_abort(&self) {
        if let Some(f) = &self.on_abort {
            f(());
        }
    }
}
