//! Sandboxed tool execution for TaskPilot.
//!
//! The [`ToolExecutor`] maps each [`Action`] variant onto its capability:
//! listing and reading files, writing or appending files, and running shell
//! commands. Every path goes through the workspace sandbox before any I/O.
//!
//! Expected failures (escaping paths, missing files, denied or timed-out
//! commands) come back as a failed [`ToolResult`] so the run can continue.
//! Only unexpected system failures are returned as [`ToolError`].

pub mod file_read;
pub mod file_write;
pub mod list_files;
pub mod shell;

use std::time::Instant;

use taskpilot_core::error::ToolError;
use taskpilot_core::tool::{Action, ToolResult};
use taskpilot_security::Workspace;
use tracing::{debug, warn};

pub use file_write::WriteMode;
pub use shell::ShellTool;

/// Default per-result output budget in characters.
pub const DEFAULT_OUTPUT_CHAR_LIMIT: usize = 4_000;

/// Executes actions against one workspace.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    workspace: Workspace,
    shell: ShellTool,
    output_char_limit: usize,
}

impl ToolExecutor {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            shell: ShellTool::default(),
            output_char_limit: DEFAULT_OUTPUT_CHAR_LIMIT,
        }
    }

    pub fn with_shell(mut self, shell: ShellTool) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_output_limit(mut self, chars: usize) -> Self {
        self.output_char_limit = chars.max(1);
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn shell_enabled(&self) -> bool {
        self.shell.is_enabled()
    }

    /// Execute one action.
    pub async fn execute(&self, action: &Action) -> Result<ToolResult, ToolError> {
        let started = Instant::now();
        let tool = action.tool_name();
        debug!(tool = %tool, "Executing tool");

        let result = match action {
            Action::ListFiles { path, limit } => {
                let workspace = self.workspace.clone();
                let path = path.clone();
                let limit = *limit;
                tokio::task::spawn_blocking(move || list_files::list_files(&workspace, &path, limit))
                    .await
                    .map_err(|e| ToolError::ExecutionFailed {
                        tool_name: tool.to_string(),
                        reason: e.to_string(),
                    })?
            }
            Action::ReadFile {
                path,
                start_line,
                end_line,
            } => file_read::read_file(&self.workspace, path, *start_line, *end_line).await,
            Action::WriteFile { path, content } => {
                file_write::write_file(&self.workspace, path, content, WriteMode::Overwrite).await
            }
            Action::AppendFile { path, content } => {
                file_write::write_file(&self.workspace, path, content, WriteMode::Append).await
            }
            Action::RunShell { command, timeout_sec } => {
                self.shell.run(self.workspace.root(), command, *timeout_sec).await?
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = result
            .with_duration(duration_ms)
            .truncate_output(self.output_char_limit);

        if result.success {
            debug!(tool = %tool, duration_ms, truncated = result.truncated, "Tool succeeded");
        } else {
            warn!(tool = %tool, duration_ms, failure = ?result.failure, "Tool failed");
        }
        Ok(result)
    }

    /// Workspace-relative file listing used for the initial file tree.
    pub fn file_tree(&self, limit: usize) -> String {
        list_files::list_files(&self.workspace, ".", limit).output
    }
}
