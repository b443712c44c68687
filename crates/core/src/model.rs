//! Model backend trait — the abstraction over language-model inference.
//!
//! The run loop only needs two capabilities: turn a message history into
//! text, and (optionally) turn an image into text. Everything else about the
//! backend (transport, batching, device placement) stays behind this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ModelError;
use crate::message::Message;

/// Per-run generation settings.
///
/// Carries the sampling parameters the backend needs plus the run-level
/// knobs (step limit, shell/OCR switches) chosen at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of orchestrator steps
    pub step_limit: u32,

    pub min_new_tokens: u32,
    pub max_new_tokens: u32,

    /// Temperature (0.0 = greedy)
    pub temperature: f32,
    pub top_p: f32,

    /// Model used for code/planning generation
    pub coder_model: String,

    pub lazy_load: bool,
    pub sparse_load: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gpu_memory_gib: Option<u32>,

    /// Whether `run_shell` actions may execute
    pub allow_shell: bool,

    /// Whether an attached image is passed through text extraction
    pub enable_ocr: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            step_limit: 10,
            min_new_tokens: 32,
            max_new_tokens: 2048,
            temperature: 0.0,
            top_p: 0.95,
            coder_model: "deepseek-coder".into(),
            lazy_load: true,
            sparse_load: true,
            max_gpu_memory_gib: None,
            allow_shell: true,
            enable_ocr: true,
        }
    }
}

/// The inference capability consumed by the orchestrator.
///
/// Implementations must be safe to share across concurrently running runs.
/// Backends that block (local inference) must offload to `spawn_blocking`.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// A human-readable name for this backend.
    fn name(&self) -> &str;

    /// Generate the next assistant message for the given history.
    async fn generate(
        &self,
        messages: &[Message],
        config: &GenerationConfig,
    ) -> Result<String, ModelError>;

    /// Extract text (as markdown) from an image file.
    ///
    /// Default implementation reports the capability as unavailable.
    async fn extract_text_from_image(&self, _path: &Path) -> Result<String, ModelError> {
        Err(ModelError::NotConfigured(format!(
            "Model backend '{}' does not support image text extraction",
            self.name()
        )))
    }
}
