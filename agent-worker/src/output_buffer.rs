//! Per-task append-only chunk log with positional reads and push
//! subscribers, plus a manager that indexes buffers by task id and evicts
//! completed ones after an age threshold.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Status,
    Text,
    Thinking,
    ToolUse,
    ToolResult,
    Error,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkAttrs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_progress: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputChunk {
    pub position: u64,
    pub chunk_type: ChunkType,
    pub content: String,
    pub attrs: ChunkAttrs,
}

type Subscriber = Arc<dyn Fn(&OutputChunk) + Send + Sync>;

/// Append-only log for a single task. Positions start at 0 and are dense:
/// once a chunk is returned from `get_chunks`, it never changes, and a
/// repeated call with the same `from_position` returns the same prefix plus
/// any newly appended chunks.
pub struct OutputBuffer {
    chunks: Mutex<Vec<OutputChunk>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self { chunks: Mutex::new(Vec::new()), subscribers: Mutex::new(Vec::new()) }
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk_type: ChunkType, content: String, attrs: ChunkAttrs) -> u64 {
        let chunk = {
            let mut chunks = self.chunks.lock().unwrap();
            let position = chunks.len() as u64;
            let chunk = OutputChunk { position, chunk_type, content, attrs };
            chunks.push(chunk.clone());
            chunk
        };
        for subscriber in self.subscribers.lock().unwrap().iter() {
            subscriber(&chunk);
        }
        chunk.position
    }

    pub fn count(&self) -> u64 {
        self.chunks.lock().unwrap().len() as u64
    }

    pub fn get_chunks(&self, from_position: Option<u64>) -> Vec<OutputChunk> {
        let chunks = self.chunks.lock().unwrap();
        let from = from_position.unwrap_or(0) as usize;
        chunks.iter().skip(from).cloned().collect()
    }

    pub fn subscribe(&self, callback: Subscriber) {
        self.subscribers.lock().unwrap().push(callback);
    }

    pub fn clear(&self) {
        self.chunks.lock().unwrap().clear();
        self.subscribers.lock().unwrap().clear();
    }
}

struct ManagedBuffer {
    buffer: Arc<OutputBuffer>,
    completed_at: Mutex<Option<Instant>>,
}

/// Indexes buffers by task id; evicts completed buffers once older than the
/// eviction threshold, keeping running buffers around indefinitely.
pub struct OutputBufferManager {
    buffers: Mutex<HashMap<String, Arc<ManagedBuffer>>>,
    eviction_age: Duration,
}

impl OutputBufferManager {
    pub fn new(eviction_age: Duration) -> Self {
        Self { buffers: Mutex::new(HashMap::new()), eviction_age }
    }

    pub fn get_or_create(&self, task_id: &str) -> Arc<OutputBuffer> {
        let mut buffers = self.buffers.lock().unwrap();
        buffers
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(ManagedBuffer { buffer: Arc::new(OutputBuffer::new()), completed_at: Mutex::new(None) }))
            .buffer
            .clone()
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<OutputBuffer>> {
        self.buffers.lock().unwrap().get(task_id).map(|b| b.buffer.clone())
    }

    pub fn mark_completed(&self, task_id: &str) {
        if let Some(b) = self.buffers.lock().unwrap().get(task_id) {
            *b.completed_at.lock().unwrap() = Some(Instant::now());
        }
    }

    pub fn evict_expired(&self) {
        let mut buffers = self.buffers.lock().unwrap();
        buffers.retain(|_, b| match *b.completed_at.lock().unwrap() {
            Some(completed) => completed.elapsed() < self.eviction_age,
            None => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn positions_are_dense_and_increasing() {
        let buf = OutputBuffer::new();
        let p0 = buf.append(ChunkType::Text, "a".into(), ChunkAttrs::default());
        let p1 = buf.append(ChunkType::Text, "b".into(), ChunkAttrs::default());
        assert_eq!(p0, 0);
        assert_eq!(p1, 1);
        assert_eq!(buf.count(), 2);
    }

    #[test]
    fn repeated_reads_from_position_return_stable_prefix_plus_new() {
        let buf = OutputBuffer::new();
        buf.append(ChunkType::Text, "a".into(), ChunkAttrs::default());
        let first = buf.get_chunks(Some(0));
        assert_eq!(first.len(), 1);
        buf.append(ChunkType::Text, "b".into(), ChunkAttrs::default());
        let second = buf.get_chunks(Some(0));
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].content, first[0].content);
    }

    #[test]
    fn from_position_beyond_count_yields_empty() {
        let buf = OutputBuffer::new();
        buf.append(ChunkType::Text, "a".into(), ChunkAttrs::default());
        assert!(buf.get_chunks(Some(10)).is_empty());
    }

    #[test]
    fn subscribers_receive_each_append() {
        let buf = OutputBuffer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        buf.subscribe(Arc::new(move |_chunk| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        buf.append(ChunkType::Text, "a".into(), ChunkAttrs::default());
        buf.append(ChunkType::Text, "b".into(), ChunkAttrs::default());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn manager_evicts_only_completed_and_expired_buffers() {
        let manager = OutputBufferManager::new(Duration::from_millis(10));
        manager.get_or_create("running");
        manager.get_or_create("done");
        manager.mark_completed("done");
        std::thread::sleep(Duration::from_millis(20));
        manager.evict_expired();
        assert!(manager.get("running").is_some());
        assert!(manager.get("done").is_none());
    }
}
