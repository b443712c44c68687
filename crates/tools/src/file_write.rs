//! File write tools — overwrite or append, creating parent directories.

use tokio::io::AsyncWriteExt;

use taskpilot_core::tool::{ToolFailure, ToolName, ToolResult};
use taskpilot_security::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Append,
}

impl WriteMode {
    fn tool(self) -> ToolName {
        match self {
            WriteMode::Overwrite => ToolName::WriteFile,
            WriteMode::Append => ToolName::AppendFile,
        }
    }
}

/// Write `content` to `path` inside the workspace.
///
/// The path is checked before any directory is created.
pub async fn write_file(workspace: &Workspace, path: &str, content: &str, mode: WriteMode) -> ToolResult {
    let tool = mode.tool();
    let target = match workspace.resolve(path) {
        Ok(p) => p,
        Err(e) => return ToolResult::failed(tool, ToolFailure::PathEscape, format!("error: {e}")),
    };

    // Ensure parent directory exists
    if let Some(parent) = target.parent()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        return ToolResult::failed(tool, ToolFailure::Io, format!("error: failed to create directory: {e}"));
    }

    let written = match mode {
        WriteMode::Overwrite => tokio::fs::write(&target, content).await,
        WriteMode::Append => append(&target, content).await,
    };

    match written {
        Ok(()) => {
            let verb = match mode {
                WriteMode::Overwrite => "wrote",
                WriteMode::Append => "appended",
            };
            ToolResult::ok(tool, format!("{verb} {} bytes to {path}", content.len()))
        }
        Err(e) => ToolResult::failed(tool, ToolFailure::Io, format!("error: failed to write {path}: {e}")),
    }
}

async fn append(target: &std::path::Path, content: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await
}
