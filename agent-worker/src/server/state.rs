//! Shared, process-wide server state: store, output buffers, and the set of
//! currently-executing tasks (for cancellation and live status lookups).

use crate::output_buffer::OutputBufferManager;
use crate::store::Store;
use agent_core::{CancelToken, ToolRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Live-execution snapshot for a still-running task, kept alongside the
/// persisted record so `get_status` can answer without a store round trip.
#[derive(Clone, Debug)]
pub struct LiveStatus {
    pub status: String,
    pub output_count: u64,
}

pub struct RunningTask {
    pub cancel: CancelToken,
    pub live_status: Mutex<LiveStatus>,
}

pub struct ServerState {
    pub store: Arc<Store>,
    pub buffers: Arc<OutputBufferManager>,
    pub registry: Arc<ToolRegistry>,
    pub running: Mutex<HashMap<String, Arc<RunningTask>>>,
}

impl ServerState {
    pub fn new(store: Arc<Store>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            store,
            buffers: Arc::new(OutputBufferManager::new(Duration::from_secs(3600))),
            registry,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_running(&self, task_id: &str, cancel: CancelToken) {
        self.running.lock().unwrap().insert(
            task_id.to_string(),
            Arc::new(RunningTask { cancel, live_status: Mutex::new(LiveStatus { status: "running".into(), output_count: 0 }) }),
        );
    }

    pub fn running_task(&self, task_id: &str) -> Option<Arc<RunningTask>> {
        self.running.lock().unwrap().get(task_id).cloned()
    }

    pub fn finish_running(&self, task_id: &str) {
        self.running.lock().unwrap().remove(task_id);
    }
}
