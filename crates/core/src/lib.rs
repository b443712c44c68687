//! # TaskPilot Core
//!
//! Domain types, traits, and error definitions for the TaskPilot agent
//! runtime, plus the run registry every other crate reports into.
//!
//! ## Design Philosophy
//!
//! The model backend is defined as a trait here; implementations live in
//! `taskpilot-providers`. The set of agent actions is a closed enum so the
//! executor can match exhaustively. All crates depend inward on core.

pub mod error;
pub mod event;
pub mod message;
pub mod model;
pub mod registry;
pub mod run;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, FormatError, ModelError, Result, RunError, SandboxError, ToolError};
pub use event::{EventKind, RunEvent};
pub use message::{Message, Role};
pub use model::{GenerationConfig, ModelBackend};
pub use registry::{CancelOutcome, Closing, NewRun, RunHandle, RunRegistry, RunSnapshot};
pub use run::{Phase, RunRecord, RunStatus, RunSummary};
pub use tool::{Action, ToolFailure, ToolName, ToolResult};
