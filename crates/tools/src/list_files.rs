//! Directory listing — sorted, recursive, bounded.

use std::fs;
use std::path::Path;

use taskpilot_core::tool::{ToolFailure, ToolName, ToolResult};
use taskpilot_security::Workspace;

/// Directory names never descended into.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    ".venv",
    "node_modules",
    "target",
];

pub const CLIPPED_MARKER: &str = "[list_files clipped by limit]";

/// Workspace-relative file paths under `path`, pre-order, sorted per directory.
///
/// Returns the paths and whether the limit cut the walk short.
pub fn collect(workspace: &Workspace, path: &str, limit: usize) -> Result<(Vec<String>, bool), String> {
    let base = workspace.resolve(path).map_err(|e| e.to_string())?;
    if !base.exists() {
        return Err(format!("path does not exist: {path}"));
    }
    if !base.is_dir() {
        return Err(format!("path is not a directory: {path}"));
    }

    let mut rows = Vec::new();
    let clipped = walk(workspace, &base, limit, &mut rows).map_err(|e| e.to_string())?;
    Ok((rows, clipped))
}

fn walk(workspace: &Workspace, dir: &Path, limit: usize, rows: &mut Vec<String>) -> std::io::Result<bool> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let name = entry.file_name();
        if file_type.is_dir() {
            if !IGNORED_DIRS.iter().any(|d| name == *d) {
                dirs.push(entry.path());
            }
        } else {
            files.push(entry.path());
        }
    }
    files.sort();
    dirs.sort();

    for file in files {
        rows.push(workspace.display_relative(&file));
        if rows.len() >= limit {
            return Ok(true);
        }
    }
    for sub in dirs {
        if walk(workspace, &sub, limit, rows)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Execute a `list_files` action. Blocking; call from `spawn_blocking`.
pub fn list_files(workspace: &Workspace, path: &str, limit: usize) -> ToolResult {
    if let Err(e) = workspace.resolve(path) {
        return ToolResult::failed(ToolName::ListFiles, ToolFailure::PathEscape, format!("error: {e}"));
    }
    match collect(workspace, path, limit) {
        Ok((rows, _)) if rows.is_empty() => ToolResult::ok(ToolName::ListFiles, "(no files)"),
        Ok((rows, clipped)) => {
            let mut output = rows.join("\n");
            if clipped {
                output.push('\n');
                output.push_str(CLIPPED_MARKER);
            }
            ToolResult::ok(ToolName::ListFiles, output)
        }
        Err(e) => ToolResult::failed(ToolName::ListFiles, ToolFailure::Io, format!("error: {e}")),
    }
}
