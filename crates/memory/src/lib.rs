//! Session memory for TaskPilot.
//!
//! A bounded, ordered list of summaries of finished runs. Recent entries are
//! rendered into the first prompt of each new run so the agent can build on
//! earlier work. Optionally persisted as JSON lines.

pub mod entry;
pub mod session;

pub use entry::{MemoryEntry, MemoryStatus};
pub use session::{MemoryContext, Order, SessionMemory};
