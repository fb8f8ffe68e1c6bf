//! Request normalization: find the caller's chat turns in an arbitrarily shaped JSON body.
//!
//! Clients disagree on where the conversation lives (`messages`, `input`, or one of several
//! wrapper objects). Each [`Source`] knows how to look in one place; sources are tried in a fixed
//! order and the first one yielding at least one valid turn wins.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Bound on nested wrappers / content parts followed while classifying.
const MAX_DEPTH: usize = 8;

/// Keys checked, in order, when a content value is an object.
const TEXT_KEYS: &[&str] = &["text", "content", "input_text", "value"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    /// Taken verbatim from the request; not checked against system/user/assistant.
    pub role: String,
    pub text: String,
}

impl ChatTurn {
    fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Conversation {
    turns: Vec<ChatTurn>,
}

impl Conversation {
    pub fn new(turns: Vec<ChatTurn>) -> Self {
        Self { turns }
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }
}

/// A place in the request body where a conversation may be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Messages,
    Input,
    Wrapper(&'static str),
}

/// Priority order; multiple sources may be present at once, so this order is the tie-break.
pub const SOURCES: &[Source] = &[
    Source::Messages,
    Source::Input,
    Source::Wrapper("data"),
    Source::Wrapper("payload"),
    Source::Wrapper("request"),
    Source::Wrapper("inputs"),
    Source::Wrapper("params"),
];

impl Source {
    pub fn name(&self) -> &'static str {
        match self {
            Source::Messages => "messages",
            Source::Input => "input",
            Source::Wrapper(name) => name,
        }
    }

    pub fn extract(&self, body: &Value) -> Option<Conversation> {
        let value = body.get(self.name())?;
        let turns = match self {
            Source::Messages => turns_from_messages(value),
            Source::Input | Source::Wrapper(_) => classify(value, 0),
        };
        (!turns.is_empty()).then(|| Conversation::new(turns))
    }
}

/// Locate the conversation and report which source supplied it.
pub fn locate_conversation(body: &Value) -> Option<(Source, Conversation)> {
    if !body.is_object() {
        return None;
    }
    SOURCES
        .iter()
        .find_map(|source| source.extract(body).map(|c| (*source, c)))
}

pub fn normalize_request(body: &Value) -> Option<Conversation> {
    let (source, conversation) = locate_conversation(body)?;
    debug!(
        "conversation of {} turns taken from '{}'",
        conversation.len(),
        source.name()
    );
    Some(conversation)
}

/// `messages` must already be an array of turn-like objects.
fn turns_from_messages(value: &Value) -> Vec<ChatTurn> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| item.as_object().and_then(|m| turn_from_object(m, 1)))
        .collect()
}

/// The shared recursive classifier used for every non-`messages` source.
fn classify(value: &Value, depth: usize) -> Vec<ChatTurn> {
    if depth > MAX_DEPTH {
        return Vec::new();
    }
    match value {
        Value::String(s) => non_empty(s).map(ChatTurn::user).into_iter().collect(),
        Value::Array(items) => {
            if !items.is_empty() && items.iter().all(Value::is_string) {
                let joined = items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("\n");
                return non_empty(&joined).map(ChatTurn::user).into_iter().collect();
            }
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => non_empty(s).map(ChatTurn::user),
                    Value::Object(map) => turn_from_object(map, depth + 1),
                    _ => None,
                })
                .collect()
        }
        Value::Object(map) => {
            for nested in ["messages", "input"] {
                if let Some(inner) = map.get(nested) {
                    let turns = classify(inner, depth + 1);
                    if !turns.is_empty() {
                        return turns;
                    }
                }
            }
            turn_from_object(map, depth + 1).into_iter().collect()
        }
        _ => Vec::new(),
    }
}

/// A turn needs a role string and non-empty text; anything else is dropped.
fn turn_from_object(map: &Map<String, Value>, depth: usize) -> Option<ChatTurn> {
    let role = map.get("role").and_then(Value::as_str).and_then(non_empty)?;
    let text = match map.get("content") {
        Some(content) => content_text(content, depth + 1),
        None => object_text(map, depth + 1),
    };
    let text = non_empty(&text)?;
    Some(ChatTurn {
        role: role.to_string(),
        text: text.to_string(),
    })
}

/// Text of a content value: a string, an array of parts, or an object exposing one of
/// [`TEXT_KEYS`] (possibly one level deeper, as in `{text: {value}}`).
fn content_text(value: &Value, depth: usize) -> String {
    if depth > MAX_DEPTH {
        return String::new();
    }
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|p| content_text(p, depth + 1))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => object_text(map, depth + 1),
        _ => String::new(),
    }
}

fn object_text(map: &Map<String, Value>, depth: usize) -> String {
    TEXT_KEYS
        .iter()
        .filter_map(|key| map.get(*key))
        .map(|v| content_text(v, depth))
        .find(|t| !t.is_empty())
        .unwrap_or_default()
}

fn non_empty(s: &str) -> Option<&str> {
    if s.trim().is_empty() { None } else { Some(s) }
}
