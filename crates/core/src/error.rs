//! Error types for the TaskPilot domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all TaskPilot operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Sandbox errors ---
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    // --- Model output errors ---
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Model backend errors ---
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    // --- Session memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Run errors ---
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("Path escapes workspace: {path}")]
    PathEscape { path: String },

    #[error("Invalid workspace {path}: {reason}")]
    InvalidWorkspace { path: String, reason: String },
}

/// Raised when model output cannot be turned into a valid decision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("No JSON object found in model output")]
    NoJson,

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Decision must be a JSON object")]
    NotAnObject,

    #[error("Field '{field}' is invalid: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Decision has neither actions nor a final answer")]
    EmptyDecision,
}

/// Unexpected tool system failures. Expected failures (missing files,
/// timeouts, denied commands) are reported through a failed `ToolResult`.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool executor unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by model backend, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model backend not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt memory record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// A failure that terminates a run with status `error`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("model generation failed: {0}")]
    Model(#[from] ModelError),

    #[error("image text extraction failed: {0}")]
    Ocr(ModelError),

    #[error("model output was not a valid decision after {attempts} attempts at step {step}: {last_error}")]
    FormatRetriesExhausted {
        step: u32,
        attempts: u32,
        last_error: FormatError,
    },

    #[error("tool system failure: {0}")]
    Tool(#[from] ToolError),

    #[error("{0}")]
    Sandbox(#[from] SandboxError),

    #[error("run cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}
