//! Capped in-memory diagnostic log shared by every component.
//!
//! Entries are kept in a ring of at most `capacity` items (oldest evicted
//! first) and mirrored into `tracing`, so the buffer is a queryable window
//! over the same events the subscriber sees.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default number of entries retained.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Filter for [`LogBuffer::snapshot`]. All fields are optional.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Only entries at exactly this level.
    pub level: Option<LogLevel>,
    /// Only entries whose message contains this substring.
    pub contains: Option<String>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl LogQuery {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn contains(mut self, needle: impl Into<String>) -> Self {
        self.contains = Some(needle.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(level) = self.level {
            if entry.level != level {
                return false;
            }
        }
        match &self.contains {
            Some(needle) => entry.message.contains(needle.as_str()),
            None => true,
        }
    }
}

pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Append an entry and return its id.
    pub fn append(&self, level: LogLevel, message: impl Into<String>, data: Option<Value>) -> u64 {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(data = ?data, "{}", message),
            LogLevel::Info => tracing::info!(data = ?data, "{}", message),
            LogLevel::Warn => tracing::warn!(data = ?data, "{}", message),
            LogLevel::Error => tracing::error!(data = ?data, "{}", message),
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = LogEntry {
            id,
            timestamp: Utc::now(),
            level,
            message,
            data,
        };

        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        id
    }

    pub fn debug(&self, message: impl Into<String>) -> u64 {
        self.append(LogLevel::Debug, message, None)
    }

    pub fn info(&self, message: impl Into<String>) -> u64 {
        self.append(LogLevel::Info, message, None)
    }

    pub fn warn(&self, message: impl Into<String>) -> u64 {
        self.append(LogLevel::Warn, message, None)
    }

    pub fn error(&self, message: impl Into<String>) -> u64 {
        self.append(LogLevel::Error, message, None)
    }

    /// Matching entries, oldest first, capped to the most recent `limit`.
    pub fn snapshot(&self, query: &LogQuery) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let mut matched: Vec<LogEntry> = entries
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            if matched.len() > limit {
                matched.drain(..matched.len() - limit);
            }
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
