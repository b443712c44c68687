//! Memory entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskpilot_core::run::Phase;

/// How a remembered run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Completed,
    Timeout,
    Error,
}

impl std::fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MemoryStatus::Completed => "completed",
            MemoryStatus::Timeout => "timeout",
            MemoryStatus::Error => "error",
        })
    }
}

/// Summary of one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub run_id: String,
    pub status: MemoryStatus,
    pub task: String,
    /// Phase labels seen during the run, in first-seen order
    pub patterns: Vec<Phase>,
    pub outcome: String,
    pub finished_at: DateTime<Utc>,
}

impl MemoryEntry {
    /// Record a phase label unless it was already seen.
    pub fn push_pattern(&mut self, phase: Phase) {
        if !self.patterns.contains(&phase) {
            self.patterns.push(phase);
        }
    }

    /// Multi-line rendering used in prompt context.
    pub(crate) fn render(&self, ordinal: usize) -> String {
        let patterns = if self.patterns.is_empty() {
            "unknown".to_string()
        } else {
            self.patterns
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "[Run {ordinal}] status={} time={}\ntask={}\npattern={patterns}\noutcome={}",
            self.status,
            self.finished_at.to_rfc3339(),
            clip_line(&self.task, 220),
            clip_line(&self.outcome, 300),
        )
    }
}

/// Collapse newlines and cut to `max` characters with an ellipsis.
fn clip_line(text: &str, max: usize) -> String {
    let flat = text.trim().replace('\n', " ");
    if flat.chars().count() > max {
        let cut: String = flat.chars().take(max).collect();
        format!("{cut}...")
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> MemoryEntry {
        MemoryEntry {
            run_id: "abc".into(),
            status: MemoryStatus::Completed,
            task: "fix\nthe build".into(),
            patterns: vec![],
            outcome: "x".repeat(400),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn push_pattern_dedupes() {
        let mut e = entry();
        e.push_pattern(Phase::Discovery);
        e.push_pattern(Phase::Editing);
        e.push_pattern(Phase::Discovery);
        assert_eq!(e.patterns, vec![Phase::Discovery, Phase::Editing]);
    }

    #[test]
    fn render_flattens_and_clips() {
        let rendered = entry().render(2);
        assert!(rendered.starts_with("[Run 2] status=completed time="));
        assert!(rendered.contains("task=fix the build"));
        assert!(rendered.contains("pattern=unknown"));
        let outcome = rendered.lines().last().unwrap();
        assert_eq!(outcome.len(), "outcome=".len() + 300 + 3);
    }
}
