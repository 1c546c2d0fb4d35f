//! Action recording: which commands get recorded, and how their params are
//! trimmed before they go into a session's bounded action log.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Meta and read-only methods that are never recorded.
pub const EXCLUDED_METHODS: &[&str] = &[
    "ping",
    "get_tab_events",
    "get_dialogs",
    "list_tabs",
    "list_frames",
    "list_sessions",
    "session_info",
    "session_close",
    "record_start",
    "record_stop",
    "record_save",
    "record_replay",
    "console_get_logs",
    "console_get_errors",
    "network_get_log",
    "intercept_list_rules",
];

/// Keys whose string values are bulk binary data (base64 images, uploads).
const BINARY_KEYS: &[&str] = &["base64", "data", "file_data", "image", "screenshot"];
/// Keys whose string values are free-form code or text.
const TEXT_KEYS: &[&str] = &["expression", "script", "text"];

const BINARY_LIMIT: usize = 1024;
const TEXT_LIMIT: usize = 500;

/// Current on-disk recording format.
pub const RECORDING_VERSION: u32 = 1;

pub fn is_recorded(method: &str) -> bool {
    !EXCLUDED_METHODS.contains(&method)
}

/// Copy `params` with oversized binary fields replaced and long code/text
/// fields truncated. Nested objects and arrays are walked.
pub fn redact_params(params: &Value) -> Value {
    match params {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), redact_field(key, value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_params).collect()),
        other => other.clone(),
    }
}

fn redact_field(key: &str, value: &Value) -> Value {
    match value {
        Value::String(s) if BINARY_KEYS.contains(&key) && s.len() > BINARY_LIMIT => {
            Value::String(format!("[redacted {} bytes]", s.len()))
        }
        Value::String(s) if TEXT_KEYS.contains(&key) && s.chars().count() > TEXT_LIMIT => {
            let head: String = s.chars().take(TEXT_LIMIT).collect();
            Value::String(format!("{head}…[truncated]"))
        }
        other => redact_params(other),
    }
}

/// One recorded command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub method: String,
    pub params: Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Bounded FIFO of recorded actions; the oldest entry is evicted when full.
#[derive(Debug)]
pub struct ActionLog {
    entries: VecDeque<ActionRecord>,
    capacity: usize,
}

impl ActionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: ActionRecord) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn snapshot(&self) -> Vec<ActionRecord> {
        self.entries.iter().cloned().collect()
    }
}

/// File format written by `record_save` and read by `record_replay`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Recording {
    pub version: u32,
    pub actions: Vec<ActionRecord>,
}

impl Recording {
    pub fn new(actions: Vec<ActionRecord>) -> Self {
        Self {
            version: RECORDING_VERSION,
            actions,
        }
    }
}
