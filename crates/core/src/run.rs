//! Run domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::model::GenerationConfig;

/// Lifecycle status of a run.
///
/// A run starts `Running` and moves exactly once to a terminal status.
/// Step-limit exhaustion ends as `Completed` without a final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse phase label describing what a run is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    PlanningWithMemory,
    Discovery,
    Editing,
    Verification,
    WrapUp,
    Completed,
    Timeout,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::PlanningWithMemory => "planning_with_memory",
            Phase::Discovery => "discovery",
            Phase::Editing => "editing",
            Phase::Verification => "verification",
            Phase::WrapUp => "wrap_up",
            Phase::Completed => "completed",
            Phase::Timeout => "timeout",
            Phase::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Timeout | Phase::Error)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a short run id (12 hex chars).
pub fn new_run_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Full metadata of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub task: String,
    pub workspace: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
    pub config: GenerationConfig,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub final_answer: Option<String>,
    pub error: Option<String>,
    pub progress_pct: u8,
    pub phase: Phase,
}

/// Listing view of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub status: RunStatus,
    pub task: String,
    pub workspace: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&RunRecord> for RunSummary {
    fn from(record: &RunRecord) -> Self {
        Self {
            id: record.id.clone(),
            status: record.status,
            task: record.task.clone(),
            workspace: record.workspace.display().to_string(),
            created_at: record.created_at,
            finished_at: record.finished_at,
        }
    }
}
