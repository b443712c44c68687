//! Model backend implementations for TaskPilot.
//!
//! All backends implement the `taskpilot_core::ModelBackend` trait.
//! [`build_from_config`] selects and configures one from [`ModelConfig`].

pub mod openai_compat;

use std::sync::Arc;
use std::time::Duration;

use taskpilot_config::ModelConfig;
use taskpilot_core::error::ModelError;
use taskpilot_core::model::ModelBackend;
use tracing::info;

pub use openai_compat::OpenAiCompatBackend;

/// Build the configured model backend.
pub fn build_from_config(config: &ModelConfig) -> Result<Arc<dyn ModelBackend>, ModelError> {
    if config.base_url.trim().is_empty() {
        return Err(ModelError::NotConfigured("model.base_url is empty".into()));
    }

    let backend = OpenAiCompatBackend::new(
        &config.base_url,
        Duration::from_secs(config.request_timeout_secs),
    )?
    .with_api_key(config.api_key.clone())
    .with_ocr_model(&config.ocr_model);

    info!(
        base_url = %backend.base_url(),
        coder_model = %config.coder_model,
        ocr_model = %config.ocr_model,
        "Model backend configured"
    );
    Ok(Arc::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_default_config() {
        let backend = build_from_config(&ModelConfig::default()).unwrap();
        assert_eq!(backend.name(), "openai_compat");
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let config = ModelConfig {
            base_url: "  ".into(),
            ..ModelConfig::default()
        };
        assert!(matches!(
            build_from_config(&config),
            Err(ModelError::NotConfigured(_))
        ));
    }
}
