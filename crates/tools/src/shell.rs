//! Shell tool — execute commands inside the workspace.
//!
//! Supports a command denylist, a hard timeout, and a global off switch.
//! Timed-out processes are killed when the child handle is dropped.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use taskpilot_core::error::ToolError;
use taskpilot_core::tool::{ToolFailure, ToolName, ToolResult};
use taskpilot_security::CommandDenylist;
use tokio::process::Command;
use tracing::{debug, warn};

/// Execute shell commands with safety constraints.
#[derive(Debug, Clone)]
pub struct ShellTool {
    enabled: bool,
    default_timeout: Duration,
    /// Upper bound for per-call timeout overrides
    max_timeout: Duration,
    denylist: CommandDenylist,
}

impl ShellTool {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            enabled: true,
            default_timeout,
            max_timeout: Duration::from_secs(600),
            denylist: CommandDenylist::default(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    pub fn with_denylist(mut self, denylist: CommandDenylist) -> Self {
        self.denylist = denylist;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn effective_timeout(&self, timeout_sec: Option<u64>) -> Duration {
        timeout_sec
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout)
    }

    /// Run `command` with `cwd` as working directory.
    ///
    /// Only a failure to spawn the shell itself is an `Err`.
    pub async fn run(&self, cwd: &Path, command: &str, timeout_sec: Option<u64>) -> Result<ToolResult, ToolError> {
        if !self.enabled {
            return Ok(ToolResult::failed(
                ToolName::RunShell,
                ToolFailure::Disabled,
                "error: shell tool is disabled",
            ));
        }

        if let Some(pattern) = self.denylist.matched(command) {
            warn!(command = %command, pattern = %pattern, "Blocked shell command");
            return Ok(ToolResult::failed(
                ToolName::RunShell,
                ToolFailure::Denied,
                format!("error: blocked command pattern matched: {pattern}"),
            ));
        }

        let timeout = self.effective_timeout(timeout_sec);
        debug!(command = %command, timeout_secs = timeout.as_secs(), "Executing shell command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| ToolError::ExecutionFailed {
            tool_name: ToolName::RunShell.to_string(),
            reason: e.to_string(),
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Ok(ToolResult::failed(
                    ToolName::RunShell,
                    ToolFailure::Io,
                    format!("error: failed to collect command output: {e}"),
                ));
            }
            Err(_) => {
                warn!(command = %command, timeout_secs = timeout.as_secs(), "Command timed out");
                return Ok(ToolResult::failed(
                    ToolName::RunShell,
                    ToolFailure::Timeout,
                    format!("error: command timed out after {}s", timeout.as_secs()),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);

        let mut text = format!("[exit_code={code}]\n$ {command}\n\n{stdout}");
        if !stderr.is_empty() {
            text.push_str("\n[stderr]\n");
            text.push_str(&stderr);
        }

        if output.status.success() {
            Ok(ToolResult::ok(ToolName::RunShell, text))
        } else {
            debug!(command = %command, exit_code = code, "Command exited non-zero");
            Ok(ToolResult {
                success: false,
                ..ToolResult::ok(ToolName::RunShell, text)
            })
        }
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new(Duration::from_secs(45))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_override_is_capped() {
        let tool = ShellTool::new(Duration::from_secs(45)).with_max_timeout(Duration::from_secs(60));
        assert_eq!(tool.effective_timeout(None), Duration::from_secs(45));
        assert_eq!(tool.effective_timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(tool.effective_timeout(Some(9999)), Duration::from_secs(60));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_echo() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellTool::default().run(dir.path(), "echo hello", None).await.unwrap();
        assert!(result.success);
        assert!(result.output.starts_with("[exit_code=0]\n$ echo hello\n\nhello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let result = ShellTool::default().run(dir.path(), "ls", None).await.unwrap();
        assert!(result.output.contains("marker.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellTool::default()
            .run(dir.path(), "echo oops >&2; exit 3", None)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.failure.is_none());
        assert!(result.output.starts_with("[exit_code=3]"));
        assert!(result.output.contains("[stderr]\noops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let result = ShellTool::default().run(dir.path(), "sleep 5", Some(1)).await.unwrap();
        assert_eq!(result.failure, Some(ToolFailure::Timeout));
        assert!(result.output.contains("timed out after 1s"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn blocked_command_is_not_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellTool::default()
            .run(dir.path(), "sudo touch pwned", None)
            .await
            .unwrap();
        assert_eq!(result.failure, Some(ToolFailure::Denied));
        assert!(!dir.path().join("pwned").exists());
    }

    #[tokio::test]
    async fn disabled_shell_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellTool::disabled().run(dir.path(), "echo hi", None).await.unwrap();
        assert_eq!(result.failure, Some(ToolFailure::Disabled));
    }
}
