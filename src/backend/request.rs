use axum::http::{HeaderName, HeaderValue};
use serde_json::{Map, Value, json};

use crate::config::{BackendDescriptor, BackendMode};
use crate::error::BridgeError;
use crate::normalize::Conversation;

pub const DEFAULT_MAX_OUTPUT_TOKENS: u64 = 16384;

/// Never forwarded: replaced server-side, rebuilt from the conversation, or not understood by
/// Azure.
const STRIPPED_FIELDS: &[&str] = &[
    "model",
    "stream",
    "stream_options",
    "include",
    "reasoning",
    "text",
    "messages",
    "input",
    "data",
    "payload",
    "request",
    "inputs",
    "params",
];

/// Chat-completions knobs the responses API rejects.
const CHAT_ONLY_FIELDS: &[&str] = &[
    "frequency_penalty",
    "presence_penalty",
    "stop",
    "n",
    "logit_bias",
    "logprobs",
    "seed",
];

/// Sampling and tool parameters carried over from the caller's body.
pub fn passthrough_params(body: &Value) -> Map<String, Value> {
    let mut params = body.as_object().cloned().unwrap_or_default();
    for field in STRIPPED_FIELDS {
        params.remove(*field);
    }
    retain_function_tools(&mut params);
    params
}

/// Drops non-function tool declarations; an empty list is removed along with `tool_choice`.
fn retain_function_tools(params: &mut Map<String, Value>) {
    let Some(tools) = params.remove("tools") else {
        return;
    };
    let kept: Vec<Value> = tools
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter(|t| t.get("type").and_then(Value::as_str) == Some("function"))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    if kept.is_empty() {
        params.remove("tool_choice");
    } else {
        params.insert("tools".to_string(), Value::Array(kept));
    }
}

pub fn build_chat_body(
    conversation: &Conversation,
    params: &Map<String, Value>,
    stream: bool,
) -> Value {
    let mut body = params.clone();
    let messages = conversation
        .turns()
        .iter()
        .map(|t| json!({ "role": t.role, "content": t.text }))
        .collect::<Vec<_>>();
    body.insert("messages".to_string(), Value::Array(messages));
    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }
    Value::Object(body)
}

pub fn build_responses_body(
    conversation: &Conversation,
    params: &Map<String, Value>,
    deployment: &str,
    stream: bool,
) -> Value {
    let mut body = params.clone();
    for field in CHAT_ONLY_FIELDS {
        body.remove(*field);
    }

    let max_tokens = body.remove("max_tokens");
    let max_completion_tokens = body.remove("max_completion_tokens");
    let max_output_tokens = max_tokens
        .or(max_completion_tokens)
        .filter(|v| !v.is_null())
        .unwrap_or_else(|| Value::from(DEFAULT_MAX_OUTPUT_TOKENS));
    body.insert("max_output_tokens".to_string(), max_output_tokens);

    if let Some(Value::Array(tools)) = body.get_mut("tools") {
        for tool in tools.iter_mut() {
            flatten_function_tool(tool);
        }
    }
    if let Some(choice) = body.get_mut("tool_choice") {
        flatten_function_tool(choice);
    }

    let input = conversation
        .turns()
        .iter()
        .map(|t| {
            json!({
                "role": t.role,
                "content": [{ "type": "input_text", "text": t.text }],
            })
        })
        .collect::<Vec<_>>();
    body.insert("model".to_string(), Value::String(deployment.to_string()));
    body.insert("input".to_string(), Value::Array(input));
    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }
    Value::Object(body)
}

/// `{type, function: {name, description, parameters}}` -> `{type, name, description, parameters}`.
/// Also applies to a forced `tool_choice`; string choices are left alone.
fn flatten_function_tool(tool: &mut Value) {
    let Some(obj) = tool.as_object_mut() else {
        return;
    };
    let Some(Value::Object(function)) = obj.remove("function") else {
        return;
    };
    for (k, v) in function {
        obj.entry(k).or_insert(v);
    }
}

pub fn build_body(
    descriptor: &BackendDescriptor,
    conversation: &Conversation,
    params: &Map<String, Value>,
    stream: bool,
) -> Value {
    match descriptor.mode {
        BackendMode::Chat => build_chat_body(conversation, params, stream),
        BackendMode::Responses => {
            build_responses_body(conversation, params, &descriptor.deployment, stream)
        }
    }
}

pub fn backend_url(descriptor: &BackendDescriptor) -> Result<reqwest::Url, BridgeError> {
    let base = descriptor.endpoint.trim_end_matches('/');
    let path = match descriptor.mode {
        BackendMode::Chat => format!("{base}/openai/deployments/{}/chat/completions", descriptor.deployment),
        BackendMode::Responses => format!("{base}/openai/responses"),
    };
    let mut url = reqwest::Url::parse(&path)
        .map_err(|e| BridgeError::Config(format!("invalid endpoint {base}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("api-version", &descriptor.api_version);
    Ok(url)
}

/// Chat deployments authenticate with `api-key`; the responses API takes a bearer token.
pub fn auth_header(descriptor: &BackendDescriptor) -> Result<(HeaderName, HeaderValue), BridgeError> {
    let (name, value) = match descriptor.mode {
        BackendMode::Chat => (
            HeaderName::from_static("api-key"),
            HeaderValue::from_str(&descriptor.api_key),
        ),
        BackendMode::Responses => (
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&format!("Bearer {}", descriptor.api_key)),
        ),
    };
    let mut value = value.map_err(|_| {
        BridgeError::Config("invalid api key: not a valid header value".to_string())
    })?;
    value.set_sensitive(true);
    Ok((name, value))
}
