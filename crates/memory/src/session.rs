//! Bounded session memory store with optional JSON-lines persistence.
//!
//! Entries are held in memory (oldest first) behind a `tokio::sync::RwLock`.
//! When a path is configured, entries are loaded on creation and the whole
//! file is rewritten after every mutation.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use taskpilot_core::error::MemoryError;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::entry::MemoryEntry;

pub const DEFAULT_CAPACITY: usize = 30;

/// Ordering for [`SessionMemory::recent`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Rendered memory block for a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryContext {
    pub text: String,
    /// Number of entries the text was built from
    pub entries: usize,
}

pub struct SessionMemory {
    capacity: usize,
    path: Option<PathBuf>,
    entries: RwLock<VecDeque<MemoryEntry>>,
}

impl SessionMemory {
    /// In-memory only store.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            path: None,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Store persisted at `path`. Existing entries are loaded; a missing
    /// file starts empty and is created on first write.
    pub fn with_persistence(capacity: usize, path: PathBuf) -> Self {
        let capacity = capacity.max(1);
        let mut entries = Self::load_from_disk(&path);
        while entries.len() > capacity {
            entries.pop_front();
        }
        debug!(path = %path.display(), count = entries.len(), "Session memory loaded");
        Self {
            capacity,
            path: Some(path),
            entries: RwLock::new(entries),
        }
    }

    fn load_from_disk(path: &Path) -> VecDeque<MemoryEntry> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return VecDeque::new(),
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(i, line)| match serde_json::from_str::<MemoryEntry>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    let err = MemoryError::Corrupt {
                        line: i + 1,
                        reason: e.to_string(),
                    };
                    warn!(error = %err, "Skipping corrupted memory entry");
                    None
                }
            })
            .collect()
    }

    /// Rewrite the persistence file, if any.
    fn flush(&self, entries: &VecDeque<MemoryEntry>) -> Result<(), MemoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MemoryError::Storage(format!("Failed to create memory directory: {e}")))?;
        }

        let mut content = String::new();
        for entry in entries {
            let line = serde_json::to_string(entry)
                .map_err(|e| MemoryError::Storage(format!("Failed to serialize memory entry: {e}")))?;
            content.push_str(&line);
            content.push('\n');
        }

        std::fs::write(path, content)
            .map_err(|e| MemoryError::Storage(format!("Failed to write memory file: {e}")))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, evicting the oldest beyond capacity.
    ///
    /// The in-memory append always happens; a persistence failure is
    /// reported but does not undo it.
    pub async fn append(&self, entry: MemoryEntry) -> Result<(), MemoryError> {
        let mut entries = self.entries.write().await;
        debug!(run_id = %entry.run_id, status = %entry.status, "Remembering run");
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        self.flush(&entries)
    }

    /// Up to `limit` most recent entries in the requested order.
    pub async fn recent(&self, limit: usize, order: Order) -> Vec<MemoryEntry> {
        let entries = self.entries.read().await;
        let skip = entries.len().saturating_sub(limit);
        let mut out: Vec<MemoryEntry> = entries.iter().skip(skip).cloned().collect();
        if order == Order::NewestFirst {
            out.reverse();
        }
        out
    }

    /// Render the `max_entries` most recent entries, oldest first, keeping
    /// at most the last `max_chars` characters. `None` when empty.
    pub async fn render_context(&self, max_entries: usize, max_chars: usize) -> Option<MemoryContext> {
        let recent = self.recent(max_entries, Order::OldestFirst).await;
        if recent.is_empty() {
            return None;
        }

        let rendered = recent
            .iter()
            .enumerate()
            .map(|(i, e)| e.render(i + 1))
            .collect::<Vec<_>>()
            .join("\n\n");

        let total = rendered.chars().count();
        let text = if total > max_chars {
            rendered.chars().skip(total - max_chars).collect()
        } else {
            rendered
        };

        Some(MemoryContext {
            text,
            entries: recent.len(),
        })
    }

    /// Remove every entry. Idempotent.
    pub async fn clear(&self) -> Result<(), MemoryError> {
        let mut entries = self.entries.write().await;
        entries.clear();
        self.flush(&entries)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for SessionMemory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
