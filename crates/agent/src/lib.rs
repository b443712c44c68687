//! The step-bounded run loop for TaskPilot.
//!
//! A run follows a **Decide → Act → Observe** cycle:
//!
//! 1. **Build context** (system prompt, task, file tree, session memory, image text)
//! 2. **Ask the model** for one JSON decision, re-prompting on malformed output
//! 3. **If actions**: execute them in the sandbox, feed results back, loop to 2
//! 4. **If final answer**: record it and stop
//!
//! The loop also stops when the step limit is reached, on a fatal error, or
//! when the run is cancelled. Every step is reported as events on the run's
//! [`RunHandle`](taskpilot_core::RunHandle).

pub mod orchestrator;
pub mod parser;
pub mod progress;
pub mod prompt;

#[cfg(test)]
mod test_helpers;

pub use orchestrator::{Orchestrator, OrchestratorSettings, RunOutcome, TIMEOUT_MESSAGE};
pub use parser::{Decision, parse_decision};
pub use progress::{Progress, ProgressInput, classify};
