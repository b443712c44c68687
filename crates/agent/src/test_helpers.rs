//! Shared test helpers for orchestrator tests.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use taskpilot_core::error::ModelError;
use taskpilot_core::message::Message;
use taskpilot_core::model::{GenerationConfig, ModelBackend};

/// A model that replays a scripted sequence of responses.
///
/// Each call to `generate` returns the next response. Once the script runs
/// out the last response repeats, so step-limit tests need only one entry.
pub struct ScriptedModel {
    responses: Mutex<Vec<Result<String, ModelError>>>,
    call_count: Mutex<usize>,
    seen: Mutex<Vec<Vec<Message>>>,
    ocr: Option<Result<String, ModelError>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<&str>) -> Self {
        Self::with_results(responses.into_iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn with_results(responses: Vec<Result<String, ModelError>>) -> Self {
        assert!(!responses.is_empty(), "ScriptedModel needs at least one response");
        Self {
            responses: Mutex::new(responses),
            call_count: Mutex::new(0),
            seen: Mutex::new(Vec::new()),
            ocr: None,
            delay: None,
        }
    }

    pub fn with_ocr(mut self, result: Result<String, ModelError>) -> Self {
        self.ocr = Some(result);
        self
    }

    /// Sleep before every response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    /// Message histories passed to each `generate` call.
    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ModelBackend for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        messages: &[Message],
        _config: &GenerationConfig,
    ) -> Result<String, ModelError> {
        self.seen.lock().unwrap().push(messages.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut count = self.call_count.lock().unwrap();
        let responses = self.responses.lock().unwrap();
        let index = (*count).min(responses.len() - 1);
        *count += 1;
        responses[index].clone()
    }

    async fn extract_text_from_image(&self, _path: &Path) -> Result<String, ModelError> {
        match &self.ocr {
            Some(result) => result.clone(),
            None => Err(ModelError::NotConfigured("no OCR scripted".into())),
        }
    }
}

/// Decision JSON with a single action.
pub fn action_json(tool: &str, args: serde_json::Value) -> String {
    serde_json::json!({
        "thought": format!("use {tool}"),
        "actions": [{"tool": tool, "args": args}],
        "final_answer": null,
    })
    .to_string()
}

/// Decision JSON with only a final answer.
pub fn answer_json(answer: &str) -> String {
    serde_json::json!({
        "thought": "finished",
        "actions": [],
        "final_answer": answer,
    })
    .to_string()
}
