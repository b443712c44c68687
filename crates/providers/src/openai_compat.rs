//! OpenAI-compatible model backend.
//!
//! Works with any server exposing `/v1/chat/completions`: vLLM, Ollama,
//! llama.cpp server, LM Studio, or a hosted API. Decisions come from the
//! coder model; image text extraction sends the image inline as a base64
//! `data:` URL to the OCR model.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use taskpilot_core::error::ModelError;
use taskpilot_core::message::Message;
use taskpilot_core::model::{GenerationConfig, ModelBackend};
use tracing::{debug, warn};

/// Prompt sent alongside an image for text extraction.
pub const OCR_PROMPT: &str = "Convert this image to markdown.";

/// Token budget for the OCR response.
const OCR_MAX_TOKENS: u32 = 4096;

/// A model backend speaking the OpenAI chat completions protocol.
pub struct OpenAiCompatBackend {
    name: String,
    base_url: String,
    api_key: Option<String>,
    ocr_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    /// Create a backend for `base_url` (for example `http://localhost:8000/v1`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::NotConfigured(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: "openai_compat".into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            ocr_model: "deepseek-ai/DeepSeek-OCR".into(),
            client,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_ocr_model(mut self, model: impl Into<String>) -> Self {
        self.ocr_model = model.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_body(messages: &[Message], config: &GenerationConfig) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": config.coder_model,
            "messages": messages
                .iter()
                .map(|m| ApiMessage {
                    role: m.role.as_str(),
                    content: serde_json::Value::String(m.content.clone()),
                })
                .collect::<Vec<_>>(),
            "temperature": config.temperature,
            "max_tokens": config.max_new_tokens,
            "stream": false,
        });

        if config.min_new_tokens > 0 {
            body["min_tokens"] = serde_json::json!(config.min_new_tokens);
        }

        // Sampling parameters only matter when not greedy
        if config.temperature > 0.0 {
            body["top_p"] = serde_json::json!(config.top_p);
        }

        body
    }

    fn ocr_body(&self, data_url: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.ocr_model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "image_url", "image_url": {"url": data_url}},
                    {"type": "text", "text": OCR_PROMPT},
                ],
            }],
            "temperature": 0.0,
            "max_tokens": OCR_MAX_TOKENS,
            "stream": false,
        })
    }

    async fn post_chat(&self, body: &serde_json::Value) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout(e.to_string())
            } else {
                ModelError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(backend = %self.name, status, body = %error_body, "Model backend returned error");
            return Err(status_error(status, error_body));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(format!("Failed to parse response: {e}")))?;

        first_choice_text(api_response)
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        messages: &[Message],
        config: &GenerationConfig,
    ) -> Result<String, ModelError> {
        debug!(
            backend = %self.name,
            model = %config.coder_model,
            messages = messages.len(),
            "Sending completion request"
        );
        self.post_chat(&Self::chat_body(messages, config)).await
    }

    async fn extract_text_from_image(&self, path: &Path) -> Result<String, ModelError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            ModelError::MalformedResponse(format!("Failed to read image {}: {e}", path.display()))
        })?;
        let data_url = format!("data:{};base64,{}", image_mime(path), STANDARD.encode(&bytes));

        debug!(backend = %self.name, model = %self.ocr_model, bytes = bytes.len(), "Sending OCR request");
        self.post_chat(&self.ocr_body(&data_url)).await
    }
}

/// Map a non-200 status to the matching error.
fn status_error(status: u16, body: String) -> ModelError {
    match status {
        429 => ModelError::RateLimited {
            retry_after_secs: 5,
        },
        401 | 403 => {
            ModelError::AuthenticationFailed("Invalid API key or insufficient permissions".into())
        }
        404 => ModelError::ModelNotFound(body),
        _ => ModelError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

fn first_choice_text(response: ApiResponse) -> Result<String, ModelError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::MalformedResponse("No choices in response".into()))?;
    Ok(choice.message.content.unwrap_or_default())
}

fn image_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "image/png",
    }
}

// --- API types ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}
