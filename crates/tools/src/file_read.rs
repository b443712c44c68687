//! File read tool — numbered line ranges from workspace files.

use taskpilot_core::tool::{ToolFailure, ToolName, ToolResult};
use taskpilot_security::Workspace;

/// Read lines `start_line..=end_line` (1-based, inclusive) of a file.
pub async fn read_file(
    workspace: &Workspace,
    path: &str,
    start_line: usize,
    end_line: Option<usize>,
) -> ToolResult {
    let target = match workspace.resolve(path) {
        Ok(p) => p,
        Err(e) => {
            return ToolResult::failed(ToolName::ReadFile, ToolFailure::PathEscape, format!("error: {e}"));
        }
    };

    if !target.exists() {
        return ToolResult::failed(
            ToolName::ReadFile,
            ToolFailure::Io,
            format!("error: file does not exist: {path}"),
        );
    }
    if !target.is_file() {
        return ToolResult::failed(ToolName::ReadFile, ToolFailure::Io, format!("error: not a file: {path}"));
    }

    let bytes = match tokio::fs::read(&target).await {
        Ok(b) => b,
        Err(e) => {
            return ToolResult::failed(
                ToolName::ReadFile,
                ToolFailure::Io,
                format!("error: failed to read {path}: {e}"),
            );
        }
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();

    let start = start_line.max(1);
    let finish = end_line.unwrap_or(lines.len()).min(lines.len());
    if start > finish {
        return ToolResult::failed(
            ToolName::ReadFile,
            ToolFailure::InvalidArguments,
            format!("error: invalid line range ({path} has {} lines)", lines.len()),
        );
    }

    let rendered = lines[start - 1..finish]
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{}: {line}", start + i))
        .collect::<Vec<_>>()
        .join("\n");
    ToolResult::ok(ToolName::ReadFile, rendered)
}
