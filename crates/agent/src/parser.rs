//! Action parser — turns raw model text into a validated [`Decision`].
//!
//! Model output is messy: reasoning blocks, markdown fences, prose around
//! the JSON. Parsing strips `<think>` blocks, locates the first JSON object
//! (fenced or inline), and validates every field. Anything that does not
//! yield at least one action or a final answer is a [`FormatError`].

use serde_json::{Map, Value};

use taskpilot_core::error::FormatError;
use taskpilot_core::tool::{Action, ToolName};

/// A validated model decision for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub thought: String,
    pub actions: Vec<Action>,
    pub final_answer: Option<String>,
    /// Model output with reasoning blocks removed
    pub raw_text: String,
}

/// Thoughts containing one of these are treated as a final answer when the
/// model forgot to set one.
const DONE_MARKERS: &[&str] = &[
    "task is complete",
    "task was completed",
    "now i should stop",
    "no further actions",
    "all done",
];

/// Remove `<think>...</think>` blocks (case-insensitive). An unclosed
/// block drops everything from its opening tag.
pub fn strip_think(text: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let mut out = text.to_string();
    loop {
        let lower = out.to_ascii_lowercase();
        let Some(start) = lower.find(OPEN) else {
            break;
        };
        match lower[start + OPEN.len()..].find(CLOSE) {
            Some(rel) => {
                let end = start + OPEN.len() + rel + CLOSE.len();
                out.replace_range(start..end, "");
            }
            None => {
                out.truncate(start);
                break;
            }
        }
    }
    out.trim().to_string()
}

/// The first JSON object in `text`: a fenced ```json block if present,
/// otherwise the first `{` at which a complete object decodes.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    if let Some(obj) = fenced_object(text) {
        return Some(obj);
    }

    text.char_indices()
        .filter(|(_, c)| *c == '{')
        .find_map(|(i, _)| {
            let mut stream = serde_json::Deserializer::from_str(&text[i..]).into_iter::<Value>();
            match stream.next() {
                Some(Ok(Value::Object(map))) => Some(map),
                _ => None,
            }
        })
}

fn fenced_object(text: &str) -> Option<Map<String, Value>> {
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let body_start = if after.get(..4).is_some_and(|tag| tag.eq_ignore_ascii_case("json")) {
            &after[4..]
        } else {
            after
        };
        let close = body_start.find("```")?;
        let body = body_start[..close].trim();
        if body.starts_with('{')
            && let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body)
        {
            return Some(map);
        }
        rest = &body_start[close + 3..];
    }
    None
}

/// Parse raw model output into a decision.
pub fn parse_decision(raw: &str) -> Result<Decision, FormatError> {
    let cleaned = strip_think(raw);
    let payload = extract_json_object(&cleaned).ok_or_else(|| {
        if cleaned.contains('{') {
            FormatError::InvalidJson("no complete JSON object could be decoded".into())
        } else {
            FormatError::NoJson
        }
    })?;

    let thought = match payload.get("thought") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => strip_think(s),
        Some(_) => return Err(invalid_field("thought", "must be a string")),
    };

    let actions = parse_actions(payload.get("actions"))?;

    let mut final_answer = match payload.get("final_answer") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(strip_think(s)),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => Some(v.to_string()),
        Some(_) => return Err(invalid_field("final_answer", "must be a string or null")),
    }
    .filter(|s| !s.is_empty());

    if actions.is_empty() && final_answer.is_none() && !thought.is_empty() {
        let lowered = thought.to_lowercase();
        if DONE_MARKERS.iter().any(|m| lowered.contains(m)) {
            final_answer = Some(thought.clone());
        }
    }

    if actions.is_empty() && final_answer.is_none() {
        return Err(FormatError::EmptyDecision);
    }

    Ok(Decision {
        thought,
        actions,
        final_answer,
        raw_text: cleaned,
    })
}

fn parse_actions(value: Option<&Value>) -> Result<Vec<Action>, FormatError> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(invalid_field("actions", "must be an array")),
    };

    let empty = Map::new();
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let obj = item
                .as_object()
                .ok_or_else(|| invalid_field("actions", format!("item {i} must be an object")))?;
            let tool = obj
                .get("tool")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| invalid_field("actions", format!("item {i} is missing 'tool'")))?;
            let args = match obj.get("args") {
                None | Some(Value::Null) => &empty,
                Some(Value::Object(map)) => map,
                Some(_) => {
                    return Err(FormatError::InvalidArguments {
                        tool: tool.to_string(),
                        reason: "'args' must be an object".into(),
                    });
                }
            };
            Action::from_parts(tool, args)
        })
        .collect()
}

fn invalid_field(field: &str, reason: impl Into<String>) -> FormatError {
    FormatError::InvalidField {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Whether text looks like an attempted JSON decision rather than prose.
pub fn looks_like_decision_payload(text: &str) -> bool {
    let candidate = text.trim();
    if candidate.is_empty() {
        return false;
    }
    if candidate.starts_with("```") || (candidate.starts_with('{') && candidate.ends_with('}')) {
        return true;
    }
    let lowered = candidate.to_lowercase();
    ["\"actions\"", "\"final_answer\"", "\"thought\""]
        .iter()
        .any(|key| lowered.contains(key))
}

/// Accept unstructured model output as a final answer.
///
/// Only once tools have run, and only for plain prose that neither names a
/// tool nor resembles a JSON decision.
pub fn plain_text_answer(raw: &str, tools_executed: usize) -> Option<String> {
    if tools_executed == 0 {
        return None;
    }
    let text = strip_think(raw);
    if text.is_empty() || looks_like_decision_payload(&text) {
        return None;
    }
    if ToolName::ALL.iter().any(|t| text.contains(t.as_str())) {
        return None;
    }
    Some(text)
}
