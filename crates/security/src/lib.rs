//! Security module for TaskPilot — workspace sandboxing and command screening.
//!
//! Provides:
//! - **Workspace**: path containment for every file-affecting operation
//! - **Denylist**: detection of destructive shell constructs before spawning

pub mod denylist;
pub mod workspace;

pub use denylist::CommandDenylist;
pub use workspace::Workspace;
