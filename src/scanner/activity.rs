use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

const MAX_ENTRIES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Info,
    Warning,
    Error,
    Success,
    Trade,
    Cycle,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub level: ActivityLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Append-only in-memory activity log, bounded and rotating: the oldest
/// entry falls off once the buffer is full.
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(MAX_ENTRIES)),
        }
    }

    pub fn add(&self, level: ActivityLevel, message: impl Into<String>) {
        self.add_with_data(level, message, None);
    }

    pub fn add_with_data(
        &self,
        level: ActivityLevel,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        let mut entries = self.entries.lock().expect("activity log poisoned");
        if entries.len() >= MAX_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(ActivityEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            data,
        });
    }

    pub fn recent(&self, n: usize) -> Vec<ActivityEntry> {
        let entries = self.entries.lock().expect("activity log poisoned");
        entries.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("activity log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// JSON-lines export, oldest first.
    pub fn export_jsonl(&self) -> String {
        let entries = self.entries.lock().expect("activity log poisoned");
        entries
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}
