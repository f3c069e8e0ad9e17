use std::sync::Mutex;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
};

use crate::plugin::{EmitTarget, MessageSink};

/// A single rendered line as handed to [`MessageSink::emit`].
#[derive(Debug, Clone, PartialEq)]
pub struct MessageLogEntry {
    pub target: EmitTarget,
    pub timestamp: DateTime<Utc>,
    pub tags: Vec<String>,
    pub line: String,
}

impl MessageLogEntry {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// In-memory sink that keeps every emitted line and typing update.
///
/// Used by headless hosts and tests; the lock is only held for the push.
#[derive(Default)]
pub struct MemoryMessageLog {
    entries: Mutex<Vec<MessageLogEntry>>,
    typing: Mutex<Vec<(EmitTarget, Vec<String>)>>,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<MessageLogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn typing_updates(&self) -> Vec<(EmitTarget, Vec<String>)> {
        self.typing
            .lock()
            .map(|typing| typing.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageSink for MemoryMessageLog {
    async fn emit(&self, target: &EmitTarget, timestamp: DateTime<Utc>, tags: &[&str], line: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(MessageLogEntry {
                target: target.clone(),
                timestamp,
                tags: tags.iter().map(|t| (*t).to_string()).collect(),
                line: line.to_string(),
            });
        }
    }

    async fn typing_changed(&self, target: &EmitTarget, names: &[String]) {
        if let Ok(mut typing) = self.typing.lock() {
            typing.push((target.clone(), names.to_vec()));
        }
    }
}
