//! Four-level event capture (summary < tool < llm < full) in a bounded ring
//! buffer, plus a failure analyzer that maps error substrings to canned
//! remediation suggestions.

pub mod failure_analyzer;

pub use failure_analyzer::{FailureAnalysis, FailureAnalyzer};

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Summary = 0,
    Tool = 1,
    Llm = 2,
    Full = 3,
}

#[derive(Clone, Debug)]
pub struct Entry {
    pub level: Level,
    pub entry_type: String,
    pub message: String,
    pub success: bool,
    pub timestamp_ms: u64,
}

impl Entry {
    pub fn new(level: Level, entry_type: impl Into<String>, message: impl Into<String>, success: bool) -> Self {
        Self {
            level,
            entry_type: entry_type.into(),
            message: message.into(),
            success,
            timestamp_ms: now_ms(),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[derive(Default)]
pub struct QueryFilter<'a> {
    pub min_level: Option<Level>,
    pub entry_type: Option<&'a str>,
    pub since_timestamp_ms: Option<u64>,
    pub failures_only: bool,
    pub limit: Option<usize>,
}

pub struct Stats {
    pub retained: usize,
    pub dropped: u64,
}

/// Bounded ring buffer with O(1) append, gated by an active level threshold:
/// an entry is retained iff `entry.level <= current_level`.
pub struct Logger {
    capacity: usize,
    current_level: Mutex<Level>,
    entries: Mutex<VecDeque<Entry>>,
    dropped: Mutex<u64>,
}

impl Logger {
    pub fn new(capacity: usize, level: Level) -> Self {
        Self {
            capacity,
            current_level: Mutex::new(level),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            dropped: Mutex::new(0),
        }
    }

    pub fn set_level(&self, level: Level) {
        *self.current_level.lock().unwrap() = level;
    }

    pub fn level(&self) -> Level {
        *self.current_level.lock().unwrap()
    }

    pub fn log(&self, entry: Entry) {
        if entry.level > self.level() {
            return;
        }
        match entry.level {
            Level::Summary => tracing::info!(ty = %entry.entry_type, success = entry.success, "{}", entry.message),
            Level::Tool => tracing::debug!(ty = %entry.entry_type, success = entry.success, "{}", entry.message),
            Level::Llm | Level::Full => tracing::trace!(ty = %entry.entry_type, success = entry.success, "{}", entry.message),
        }
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
            *self.dropped.lock().unwrap() += 1;
        }
        entries.push_back(entry);
    }

    pub fn query(&self, filter: QueryFilter) -> Vec<Entry> {
        let entries = self.entries.lock().unwrap();
        let mut out: Vec<Entry> = entries
            .iter()
            .filter(|e| filter.min_level.map(|m| e.level <= m).unwrap_or(true))
            .filter(|e| filter.entry_type.map(|t| e.entry_type == t).unwrap_or(true))
            .filter(|e| filter.since_timestamp_ms.map(|t| e.timestamp_ms >= t).unwrap_or(true))
            .filter(|e| !filter.failures_only || !e.success)
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    pub fn stats(&self) -> Stats {
        Stats {
            retained: self.entries.lock().unwrap().len(),
            dropped: *self.dropped.lock().unwrap(),
        }
    }
}
