//! Actions and tool results.
//!
//! The agent can only invoke a fixed set of capabilities. Each one is a
//! variant of [`Action`], and each variant validates its own arguments when
//! built from model output via [`Action::from_parts`]. Nothing outside this
//! closed set can ever reach the executor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FormatError;

/// Default `list_files` entry limit.
pub const DEFAULT_LIST_LIMIT: usize = 200;

/// Names of the capabilities the agent may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ListFiles,
    ReadFile,
    WriteFile,
    AppendFile,
    RunShell,
}

impl ToolName {
    pub const ALL: [ToolName; 5] = [
        ToolName::ListFiles,
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::AppendFile,
        ToolName::RunShell,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::ListFiles => "list_files",
            ToolName::ReadFile => "read_file",
            ToolName::WriteFile => "write_file",
            ToolName::AppendFile => "append_file",
            ToolName::RunShell => "run_shell",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Whether this tool mutates the workspace.
    pub fn is_write(&self) -> bool {
        matches!(self, ToolName::WriteFile | ToolName::AppendFile)
    }

    /// Whether this tool only inspects the workspace.
    pub fn is_read(&self) -> bool {
        matches!(self, ToolName::ListFiles | ToolName::ReadFile)
    }

    /// One-line usage string shown to the model.
    pub fn signature(&self) -> &'static str {
        match self {
            ToolName::ListFiles => "list_files(path=\".\", limit=200)",
            ToolName::ReadFile => "read_file(path, start_line=1, end_line=null)",
            ToolName::WriteFile => "write_file(path, content)",
            ToolName::AppendFile => "append_file(path, content)",
            ToolName::RunShell => "run_shell(command, timeout_sec=null)",
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tool invocation requested by the model.
///
/// Serialized as `{"tool": "<name>", "args": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum Action {
    ListFiles {
        path: String,
        limit: usize,
    },
    ReadFile {
        path: String,
        start_line: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_line: Option<usize>,
    },
    WriteFile {
        path: String,
        content: String,
    },
    AppendFile {
        path: String,
        content: String,
    },
    RunShell {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_sec: Option<u64>,
    },
}

impl Action {
    /// Build an action from a tool name and its raw JSON arguments.
    pub fn from_parts(tool: &str, args: &Map<String, Value>) -> Result<Self, FormatError> {
        let name = ToolName::parse(tool).ok_or_else(|| FormatError::UnknownTool(tool.to_string()))?;
        let args = ArgReader { tool: name, args };

        match name {
            ToolName::ListFiles => {
                let path = args.opt_string("path")?.unwrap_or_else(|| ".".into());
                let limit = args.opt_uint("limit")?.unwrap_or(DEFAULT_LIST_LIMIT as u64);
                if limit == 0 {
                    return Err(args.invalid("limit must be at least 1"));
                }
                Ok(Action::ListFiles {
                    path: if path.trim().is_empty() { ".".into() } else { path },
                    limit: limit as usize,
                })
            }
            ToolName::ReadFile => {
                let path = args.required_path()?;
                let start_line = args.opt_uint("start_line")?.unwrap_or(1);
                if start_line == 0 {
                    return Err(args.invalid("start_line must be at least 1"));
                }
                let end_line = args.opt_uint("end_line")?;
                if let Some(end) = end_line {
                    if end < start_line {
                        return Err(args.invalid("end_line must be >= start_line"));
                    }
                }
                Ok(Action::ReadFile {
                    path,
                    start_line: start_line as usize,
                    end_line: end_line.map(|e| e as usize),
                })
            }
            ToolName::WriteFile => Ok(Action::WriteFile {
                path: args.required_path()?,
                content: args.content()?,
            }),
            ToolName::AppendFile => Ok(Action::AppendFile {
                path: args.required_path()?,
                content: args.content()?,
            }),
            ToolName::RunShell => {
                let command = args
                    .opt_string("command")?
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| args.invalid("missing 'command'"))?;
                let timeout_sec = args.opt_uint("timeout_sec")?;
                if timeout_sec == Some(0) {
                    return Err(args.invalid("timeout_sec must be at least 1"));
                }
                Ok(Action::RunShell {
                    command,
                    timeout_sec,
                })
            }
        }
    }

    pub fn tool_name(&self) -> ToolName {
        match self {
            Action::ListFiles { .. } => ToolName::ListFiles,
            Action::ReadFile { .. } => ToolName::ReadFile,
            Action::WriteFile { .. } => ToolName::WriteFile,
            Action::AppendFile { .. } => ToolName::AppendFile,
            Action::RunShell { .. } => ToolName::RunShell,
        }
    }

    /// The arguments object as it appears on the wire.
    pub fn args_json(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("args").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

/// Typed access to a raw arguments object, producing `FormatError`s that
/// name the offending tool.
struct ArgReader<'a> {
    tool: ToolName,
    args: &'a Map<String, Value>,
}

impl ArgReader<'_> {
    fn invalid(&self, reason: impl Into<String>) -> FormatError {
        FormatError::InvalidArguments {
            tool: self.tool.to_string(),
            reason: reason.into(),
        }
    }

    fn opt_string(&self, key: &str) -> Result<Option<String>, FormatError> {
        match self.args.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.invalid(format!("'{key}' must be a string"))),
        }
    }

    /// Non-negative integer; numeric strings are accepted.
    fn opt_uint(&self, key: &str) -> Result<Option<u64>, FormatError> {
        match self.args.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(format!("'{key}' must be a non-negative integer"))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| self.invalid(format!("'{key}' must be a non-negative integer"))),
            Some(_) => Err(self.invalid(format!("'{key}' must be a non-negative integer"))),
        }
    }

    fn required_path(&self) -> Result<String, FormatError> {
        self.opt_string("path")?
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| self.invalid("missing 'path'"))
    }

    fn content(&self) -> Result<String, FormatError> {
        self.opt_string("content")?
            .ok_or_else(|| self.invalid("missing 'content'"))
    }
}

/// Why a tool call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailure {
    PathEscape,
    Denied,
    Timeout,
    Disabled,
    InvalidArguments,
    Io,
}

/// The outcome of executing one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: ToolName,
    pub success: bool,
    pub output: String,
    /// Whether `output` was cut to the configured budget
    #[serde(default)]
    pub truncated: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolFailure>,
}

impl ToolResult {
    pub fn ok(tool: ToolName, output: impl Into<String>) -> Self {
        Self {
            tool,
            success: true,
            output: output.into(),
            truncated: false,
            duration_ms: 0,
            failure: None,
        }
    }

    pub fn failed(tool: ToolName, failure: ToolFailure, output: impl Into<String>) -> Self {
        Self {
            tool,
            success: false,
            output: output.into(),
            truncated: false,
            duration_ms: 0,
            failure: Some(failure),
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Cut the output to at most `limit` characters, appending a marker.
    pub fn truncate_output(mut self, limit: usize) -> Self {
        if self.output.chars().count() > limit {
            let cut: String = self.output.chars().take(limit).collect();
            self.output = format!("{cut}\n...[truncated]");
            self.truncated = true;
        }
        self
    }
}
