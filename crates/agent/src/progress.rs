//! Progress classifier — maps step state to a percentage and a phase label.

use taskpilot_core::run::Phase;
use taskpilot_core::tool::ToolName;

/// Step state the classifier looks at.
#[derive(Debug, Clone, Copy)]
pub struct ProgressInput<'a> {
    /// 1-based step just finished
    pub step: u32,
    pub step_limit: u32,
    /// Tools executed over the whole run so far
    pub tools_executed: usize,
    /// Tools executed during this step
    pub step_tools: &'a [ToolName],
    /// Session memory was injected into the first prompt
    pub has_memory: bool,
}

/// Where a run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub phase: Phase,
    pub percent: u8,
}

impl Progress {
    /// Progress for a terminal phase. An error keeps the last reported value.
    pub fn terminal(phase: Phase, previous: u8) -> Self {
        let percent = match phase {
            Phase::Completed | Phase::Timeout => 100,
            _ => previous.min(100),
        };
        Self { phase, percent }
    }
}

/// Progress after a non-terminal step.
///
/// The percentage stays below 100 until the run finishes.
pub fn classify(input: &ProgressInput<'_>) -> Progress {
    let limit = input.step_limit.max(1);
    let percent = (u64::from(input.step) * 100 / u64::from(limit)).min(99) as u8;
    Progress {
        phase: phase_for(input, limit),
        percent,
    }
}

fn phase_for(input: &ProgressInput<'_>, limit: u32) -> Phase {
    if input.tools_executed == 0 {
        return if input.has_memory {
            Phase::PlanningWithMemory
        } else {
            Phase::Planning
        };
    }
    if input.step >= limit {
        return Phase::WrapUp;
    }

    let writes = input.step_tools.iter().filter(|t| t.is_write()).count();
    let reads = input.step_tools.iter().filter(|t| t.is_read()).count();
    let shell = input
        .step_tools
        .iter()
        .filter(|t| **t == ToolName::RunShell)
        .count();

    if writes > 0 && writes >= reads && writes >= shell {
        Phase::Editing
    } else if shell > writes && shell >= reads && input.step * 2 >= limit {
        Phase::Verification
    } else {
        Phase::Discovery
    }
}
