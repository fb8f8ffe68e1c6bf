//! Rebuild a chat-completion from whatever the responses API handed back.
//!
//! The backend has been seen answering in several shapes. Each shape the body matches is tried
//! in priority order; a shape that is present but carries no text falls through to the next.

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::sanitize::{sanitize_text, sanitize_value};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResponseShape<'a> {
    /// `output: [{type: "message", content: [{type: "output_text", text}]}, ...]`
    OutputArray(&'a [Value]),
    /// `output_text: "..."` or `output_text: {text | content}`
    OutputText(&'a Value),
    /// Chat-style `choices: [...]`
    Choices(&'a [Value]),
    /// `output: "..."` or `output: {text | content | message | choices[0].message.content}`
    TopLevelOutput(&'a Value),
    Unrecognized,
}

impl<'a> ResponseShape<'a> {
    pub fn name(&self) -> &'static str {
        match self {
            ResponseShape::OutputArray(_) => "output_array",
            ResponseShape::OutputText(_) => "output_text",
            ResponseShape::Choices(_) => "choices",
            ResponseShape::TopLevelOutput(_) => "output",
            ResponseShape::Unrecognized => "unrecognized",
        }
    }

    /// Shapes present in `body`, highest priority first. Always ends with `Unrecognized`.
    pub fn candidates(body: &'a Value) -> Vec<ResponseShape<'a>> {
        let mut out = Vec::new();
        if let Some(items) = body.get("output").and_then(Value::as_array) {
            out.push(ResponseShape::OutputArray(items));
        }
        if let Some(v) = body.get("output_text").filter(|v| !v.is_null()) {
            out.push(ResponseShape::OutputText(v));
        }
        if let Some(choices) = body.get("choices").and_then(Value::as_array) {
            out.push(ResponseShape::Choices(choices));
        }
        if let Some(v) = body.get("output").filter(|v| v.is_string() || v.is_object()) {
            out.push(ResponseShape::TopLevelOutput(v));
        }
        out.push(ResponseShape::Unrecognized);
        out
    }

    /// Map this shape onto choices; empty when the shape carries no text.
    pub fn choices(&self) -> Vec<ExtractedChoice> {
        match self {
            ResponseShape::OutputArray(items) => single(output_items_text(items)),
            ResponseShape::OutputText(v) => single(output_text_value(v)),
            ResponseShape::Choices(choices) => choices_text(choices),
            ResponseShape::TopLevelOutput(v) => single(top_level_output_text(v)),
            ResponseShape::Unrecognized => vec![ExtractedChoice {
                index: 0,
                text: String::new(),
                finish_reason: None,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedChoice {
    pub index: u64,
    pub text: String,
    pub finish_reason: Option<String>,
}

fn single(text: String) -> Vec<ExtractedChoice> {
    if text.is_empty() {
        return Vec::new();
    }
    vec![ExtractedChoice {
        index: 0,
        text,
        finish_reason: None,
    }]
}

fn str_field<'v>(v: &'v Value, key: &str) -> Option<&'v str> {
    v.get(key).and_then(Value::as_str)
}

fn leaf_text(v: &Value) -> Option<&str> {
    str_field(v, "text").or_else(|| str_field(v, "content"))
}

fn output_items_text(items: &[Value]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for item in items {
        let is_message = str_field(item, "type") == Some("message");
        match item.get("content") {
            Some(Value::Array(blocks)) if is_message => {
                for block in blocks {
                    let text = match str_field(block, "type") {
                        Some("output_text") | Some("text") => str_field(block, "text"),
                        _ => leaf_text(block),
                    };
                    parts.extend(text.filter(|t| !t.is_empty()));
                }
            }
            _ => parts.extend(leaf_text(item).filter(|t| !t.is_empty())),
        }
    }
    parts.join("\n")
}

fn output_text_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Object(_) => leaf_text(v).unwrap_or_default().to_string(),
        _ => String::new(),
    }
}

/// First text-bearing location of a single chat-style choice.
fn choice_text(choice: &Value) -> Option<String> {
    if let Some(text) = choice.get("message").and_then(|m| str_field(m, "content")) {
        return Some(text.to_string());
    }
    match choice.get("output") {
        Some(Value::String(s)) => return Some(s.clone()),
        Some(obj @ Value::Object(_)) => {
            if let Some(text) = leaf_text(obj).or_else(|| str_field(obj, "message")) {
                return Some(text.to_string());
            }
        }
        _ => {}
    }
    str_field(choice, "content")
        .or_else(|| str_field(choice, "text"))
        .or_else(|| choice.get("delta").and_then(|d| str_field(d, "content")))
        .or_else(|| str_field(choice, "message"))
        .map(str::to_string)
}

fn choices_text(choices: &[Value]) -> Vec<ExtractedChoice> {
    let out: Vec<ExtractedChoice> = choices
        .iter()
        .enumerate()
        .map(|(i, choice)| ExtractedChoice {
            index: choice
                .get("index")
                .and_then(Value::as_u64)
                .unwrap_or(i as u64),
            text: choice_text(choice).unwrap_or_default(),
            finish_reason: str_field(choice, "finish_reason").map(str::to_string),
        })
        .collect();
    if out.iter().all(|c| c.text.is_empty()) {
        return Vec::new();
    }
    out
}

fn top_level_output_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Object(_) => leaf_text(v)
            .or_else(|| str_field(v, "message"))
            .or_else(|| {
                v.get("choices")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("message"))
                    .and_then(|m| str_field(m, "content"))
            })
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

/// Try each shape in order; the first yielding text wins.
pub fn extract_choices(body: &Value) -> (ResponseShape<'_>, Vec<ExtractedChoice>) {
    for shape in ResponseShape::candidates(body) {
        let choices = shape.choices();
        if !choices.is_empty() {
            return (shape, choices);
        }
    }
    (ResponseShape::Unrecognized, ResponseShape::Unrecognized.choices())
}

/// `input_tokens`/`output_tokens` become `prompt_tokens`/`completion_tokens`; the total is summed
/// when the backend omits it.
pub fn map_usage(usage: &Value) -> Option<Value> {
    let usage = usage.as_object()?;
    let count = |keys: &[&str]| keys.iter().find_map(|k| usage.get(*k).and_then(Value::as_u64));
    let prompt = count(&["input_tokens", "prompt_tokens"]).unwrap_or(0);
    let completion = count(&["output_tokens", "completion_tokens"]).unwrap_or(0);
    let total = count(&["total_tokens"]).unwrap_or(prompt + completion);
    Some(json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": total,
    }))
}

/// Finish reason implied by a responses-API `status`.
pub fn finish_reason_for_status(body: &Value) -> &'static str {
    match str_field(body, "status") {
        Some("incomplete") => {
            let reason = body
                .get("incomplete_details")
                .and_then(|d| str_field(d, "reason"));
            match reason {
                Some("content_filter") => "content_filter",
                _ => "length",
            }
        }
        _ => "stop",
    }
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn completion_id(body: &Value) -> String {
    str_field(body, "id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()))
}

/// Build the caller-facing chat completion; `model` is always the caller's requested name.
pub fn to_chat_completion(body: &Value, requested_model: &str) -> Value {
    let (shape, choices) = extract_choices(body);
    debug!("responses payload matched shape {}", shape.name());
    if shape == ResponseShape::Unrecognized {
        let keys = body
            .as_object()
            .map(|m| m.keys().cloned().collect::<Vec<_>>().join(","))
            .unwrap_or_else(|| "<non-object>".to_string());
        warn!(
            "unrecognized responses payload for model {}; top-level keys: [{}]",
            requested_model,
            sanitize_text(&keys)
        );
        debug!("unrecognized responses payload: {}", sanitize_value(body));
    }
    let default_finish = finish_reason_for_status(body);

    let choices = choices
        .into_iter()
        .map(|c| {
            json!({
                "index": c.index,
                "message": { "role": "assistant", "content": c.text },
                "finish_reason": c.finish_reason.as_deref().unwrap_or(default_finish),
            })
        })
        .collect::<Vec<_>>();

    let mut out = Map::new();
    out.insert("id".to_string(), Value::String(completion_id(body)));
    out.insert("object".to_string(), Value::String("chat.completion".to_string()));
    out.insert(
        "created".to_string(),
        Value::from(
            body.get("created_at")
                .or_else(|| body.get("created"))
                .and_then(Value::as_u64)
                .unwrap_or_else(unix_now),
        ),
    );
    out.insert("model".to_string(), Value::String(requested_model.to_string()));
    out.insert("choices".to_string(), Value::Array(choices));
    if let Some(usage) = body.get("usage").and_then(map_usage) {
        out.insert("usage".to_string(), usage);
    }
    Value::Object(out)
}
