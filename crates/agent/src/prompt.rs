//! Prompt construction and history trimming.

use taskpilot_core::message::Message;
use taskpilot_core::tool::{ToolName, ToolResult};

/// Entries shown in the initial file tree.
pub const INITIAL_TREE_LIMIT: usize = 120;

/// Default character budget for the message history sent to the model.
pub const DEFAULT_HISTORY_CHAR_BUDGET: usize = 24_000;

pub const SYSTEM_PROMPT: &str = r#"You are an autonomous agent working inside a single workspace directory.
You solve coding and non-coding tasks by reasoning briefly, then using tools when they help.

Response format:
1) Reply with exactly one JSON object and nothing else.
2) Shape:
{
  "thought": "short reasoning",
  "actions": [{"tool": "tool_name", "args": {...}}],
  "final_answer": null
}
3) Each turn provide either actions or a final_answer. Never leave both empty.
4) If the task can be answered directly, give a final_answer with no actions.
5) Use tools only when they improve accuracy or the task requires workspace changes.
6) Never reference files outside the workspace.
7) Do not include <think> tags or markdown fences.
"#;

pub const FORMAT_RETRY_PROMPT: &str = "Your previous response could not be used.
Reply with ONLY one JSON object with keys thought, actions, final_answer.
- If work remains, set final_answer to null and include at least one action.
- If you are done, set actions to [] and give final_answer.
- No <think> tags, no markdown fences, and do not repeat the previous response.";

fn tool_description(tool: ToolName) -> &'static str {
    match tool {
        ToolName::ListFiles => "List files under a workspace directory (recursive, sorted).",
        ToolName::ReadFile => "Read a text file with 1-based line numbers, optionally a line range.",
        ToolName::WriteFile => "Create or overwrite a file. Parent directories are created.",
        ToolName::AppendFile => "Append text to a file, creating it if missing.",
        ToolName::RunShell => "Run a shell command in the workspace root and capture its output.",
    }
}

/// One line per tool the run may use.
pub fn tool_specs(shell_enabled: bool) -> String {
    ToolName::ALL
        .iter()
        .filter(|t| shell_enabled || **t != ToolName::RunShell)
        .map(|t| format!("- {}: {}", t.signature(), tool_description(*t)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Inputs for the first user message.
#[derive(Debug, Clone, Default)]
pub struct FirstMessage<'a> {
    pub task: &'a str,
    pub workspace_root: &'a str,
    pub file_tree: &'a str,
    pub shell_enabled: bool,
    pub session_memory: Option<&'a str>,
    pub ocr_text: Option<&'a str>,
}

impl FirstMessage<'_> {
    pub fn render(&self) -> String {
        let mut out = format!(
            "TASK:\n{}\n\nWORKSPACE_ROOT:\n{}\n\nAVAILABLE_TOOLS:\n{}\n\nINITIAL_FILE_TREE:\n{}",
            self.task,
            self.workspace_root,
            tool_specs(self.shell_enabled),
            self.file_tree,
        );
        if let Some(memory) = self.session_memory {
            out.push_str(&format!("\n\nSESSION_MEMORY:\n{memory}\n"));
        }
        if let Some(ocr) = self.ocr_text {
            out.push_str(&format!("\n\nOCR_CONTEXT:\n{ocr}\n"));
        }
        out.push_str(
            "\nThe task may be coding or non-coding. \
             If tools are unnecessary, answer directly via final_answer.\nStart now.",
        );
        out
    }
}

/// Follow-up user message after a failed parse.
pub fn format_retry_message(error: &str) -> String {
    format!("{FORMAT_RETRY_PROMPT}\nParse error: {error}")
}

/// User message feeding one tool result back to the model.
pub fn tool_feedback(args: &serde_json::Value, result: &ToolResult) -> String {
    format!(
        "TOOL_RESULT\ntool={}\nargs={}\noutput:\n{}",
        result.tool, args, result.output
    )
}

/// Keep the system prompt and first user message, plus the longest suffix
/// of the rest that fits in `max_chars`.
pub fn trim_history(messages: &[Message], max_chars: usize) -> Vec<Message> {
    if messages.len() <= 2 {
        return messages.to_vec();
    }

    let (head, tail) = messages.split_at(2);
    let mut total: usize = head.iter().map(Message::char_len).sum();
    let mut kept = 0;
    for msg in tail.iter().rev() {
        let size = msg.char_len();
        if total + size > max_chars {
            break;
        }
        total += size;
        kept += 1;
    }

    head.iter()
        .chain(&tail[tail.len() - kept..])
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_sections() {
        let text = FirstMessage {
            task: "add a README",
            workspace_root: "/tmp/ws",
            file_tree: "src/main.rs",
            shell_enabled: false,
            session_memory: Some("[Run 1] status=completed"),
            ocr_text: None,
        }
        .render();
        assert!(text.starts_with("TASK:\nadd a README\n\nWORKSPACE_ROOT:\n/tmp/ws"));
        assert!(text.contains("INITIAL_FILE_TREE:\nsrc/main.rs"));
        assert!(text.contains("SESSION_MEMORY:\n[Run 1]"));
        assert!(!text.contains("OCR_CONTEXT"));
        assert!(!text.contains("run_shell("));
        assert!(text.ends_with("Start now."));
    }

    #[test]
    fn tool_specs_include_shell_when_enabled() {
        let specs = tool_specs(true);
        assert_eq!(specs.lines().count(), 5);
        assert!(specs.contains("read_file(path, start_line=1, end_line=null)"));
    }

    #[test]
    fn feedback_format() {
        let result = ToolResult::ok(ToolName::ListFiles, "a.txt");
        let text = tool_feedback(&serde_json::json!({"path": "."}), &result);
        assert_eq!(text, "TOOL_RESULT\ntool=list_files\nargs={\"path\":\".\"}\noutput:\na.txt");
    }

    #[test]
    fn trim_keeps_head_and_recent_tail() {
        let messages = vec![
            Message::system("s".repeat(10)),
            Message::user("u".repeat(10)),
            Message::assistant("a".repeat(50)),
            Message::user("b".repeat(30)),
            Message::assistant("c".repeat(30)),
        ];
        let trimmed = trim_history(&messages, 80);
        assert_eq!(trimmed.len(), 4);
        assert_eq!(trimmed[2].content, "b".repeat(30));
        assert_eq!(trimmed[3].content, "c".repeat(30));

        // Head is always kept even when over budget
        let tiny = trim_history(&messages, 5);
        assert_eq!(tiny.len(), 2);
    }
}
