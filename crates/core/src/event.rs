//! Run events — the append-only record observers consume.
//!
//! Every event carries a gapless 0-based `index` and a timestamp assigned by
//! the registry at append time. The payload is a tagged enum serialized flat
//! next to those fields: `{"index": 3, "timestamp": "...", "type": "tool_result", ...}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::run::Phase;
use crate::tool::{Action, ToolFailure, ToolName};

/// One recorded event of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// All event payloads a run can produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Always the first event of a run
    RunStarted {
        task: String,
        step_limit: u32,
        workspace: String,
        image_path: Option<String>,
        has_session_memory: bool,
        coder_model: String,
        lazy_load: bool,
        sparse_load: bool,
        max_gpu_memory_gib: Option<u32>,
    },

    /// Session memory was injected into the first prompt
    MemoryContextUsed { memory_entries: usize },

    /// Text was extracted from the attached image
    OcrCompleted { chars: usize },

    /// The model produced a valid decision
    StepDecision {
        step: u32,
        thought: String,
        actions: Vec<Action>,
        final_answer: Option<String>,
    },

    ProgressUpdate {
        step: u32,
        step_limit: u32,
        progress_pct: u8,
        pattern: Phase,
        tools_executed: usize,
    },

    ToolStarted {
        step: u32,
        tool: ToolName,
        args: Value,
    },

    ToolResult {
        step: u32,
        tool: ToolName,
        args: Value,
        success: bool,
        output: String,
        truncated: bool,
        duration_ms: u64,
        failure: Option<ToolFailure>,
    },

    /// Model output failed to parse and the step is being re-prompted
    FormatRetry { step: u32, attempt: u32, error: String },

    RunTimeout { message: String, step_limit: u32 },

    RunCompleted { final_answer: String, step: u32 },

    RunError { message: String },
}

impl EventKind {
    /// The wire tag of this event (`"tool_result"`, `"run_error"`, ...).
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::RunStarted { .. } => "run_started",
            EventKind::MemoryContextUsed { .. } => "memory_context_used",
            EventKind::OcrCompleted { .. } => "ocr_completed",
            EventKind::StepDecision { .. } => "step_decision",
            EventKind::ProgressUpdate { .. } => "progress_update",
            EventKind::ToolStarted { .. } => "tool_started",
            EventKind::ToolResult { .. } => "tool_result",
            EventKind::FormatRetry { .. } => "format_retry",
            EventKind::RunTimeout { .. } => "run_timeout",
            EventKind::RunCompleted { .. } => "run_completed",
            EventKind::RunError { .. } => "run_error",
        }
    }

    /// Whether this event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::RunTimeout { .. } | EventKind::RunCompleted { .. } | EventKind::RunError { .. }
        )
    }
}
