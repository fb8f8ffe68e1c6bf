//! SSE pass-through with per-frame rewriting.
//!
//! Backend bytes are cut into frames on blank lines, each frame is rewritten on its own and
//! forwarded as soon as it is complete. Nothing beyond the current partial frame is buffered.

use std::pin::Pin;

use axum::body::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::response::{finish_reason_for_status, map_usage, unix_now};
use crate::config::BackendMode;
use crate::error::BridgeError;
use crate::sanitize::sanitize_text;

pub const DONE_SENTINEL: &str = "[DONE]";
const CHUNK_OBJECT: &str = "chat.completion.chunk";

/// One complete SSE frame as received, minus its terminating blank line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub bytes: Vec<u8>,
    pub delimiter: &'static str,
}

/// Splits a byte stream into frames on `\n\n` or `\r\n\r\n`, carrying partial frames over.
#[derive(Debug, Default)]
pub struct SseFramer {
    carry: Vec<u8>,
}

impl SseFramer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.carry.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((at, delimiter)) = find_delimiter(&self.carry) {
            let rest = self.carry.split_off(at + delimiter.len());
            let mut frame = std::mem::replace(&mut self.carry, rest);
            frame.truncate(at);
            frames.push(RawFrame {
                bytes: frame,
                delimiter,
            });
        }
        frames
    }

    /// Whatever is left once the backend closes; `None` when only whitespace remains.
    pub fn finish(&mut self) -> Option<RawFrame> {
        let mut rest = std::mem::take(&mut self.carry);
        if rest.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        while rest.last().is_some_and(|b| matches!(b, b'\r' | b'\n')) {
            rest.pop();
        }
        Some(RawFrame {
            bytes: rest,
            delimiter: "\n\n",
        })
    }
}

fn find_delimiter(buf: &[u8]) -> Option<(usize, &'static str)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n");
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some((b, "\r\n\r\n")),
        (Some(a), _) => Some((a, "\n\n")),
        (None, Some(b)) => Some((b, "\r\n\r\n")),
        (None, None) => None,
    }
}

/// Per-stream state for responses-mode streams.
#[derive(Debug, Clone)]
pub struct StreamAccumulator {
    pub response_id: String,
    pub created: u64,
    pub content_seen: bool,
    pub role_sent: bool,
    pub done_seen: bool,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self {
            response_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: unix_now(),
            content_seen: false,
            role_sent: false,
            done_seen: false,
        }
    }
}

impl StreamAccumulator {
    fn chunk(&self, model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.response_id,
            "object": CHUNK_OBJECT,
            "created": self.created,
            "model": model,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
        })
    }

    fn default_delta(&self) -> Value {
        if self.content_seen {
            json!({})
        } else {
            json!({ "role": "assistant", "content": "" })
        }
    }
}

/// What to do with one `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Rewrite {
    Forward,
    Replace(Value),
    Drop,
}

pub fn rewrite_payload(
    payload: &str,
    mode: BackendMode,
    model: &str,
    acc: &mut StreamAccumulator,
) -> Rewrite {
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        acc.done_seen = true;
        return Rewrite::Forward;
    }
    let Ok(Value::Object(mut obj)) = serde_json::from_str::<Value>(payload) else {
        return Rewrite::Forward;
    };
    match mode {
        BackendMode::Chat => {
            obj.insert("model".to_string(), Value::String(model.to_string()));
            Rewrite::Replace(Value::Object(obj))
        }
        BackendMode::Responses if obj.contains_key("choices") => {
            rewrite_choices_frame(&mut obj, model, acc);
            Rewrite::Replace(Value::Object(obj))
        }
        BackendMode::Responses => match obj.get("type").and_then(Value::as_str) {
            Some(kind) => rewrite_typed_event(kind, &obj, model, acc),
            None => {
                obj.insert("model".to_string(), Value::String(model.to_string()));
                Rewrite::Replace(Value::Object(obj))
            }
        },
    }
}

fn rewrite_choices_frame(obj: &mut Map<String, Value>, model: &str, acc: &mut StreamAccumulator) {
    if let Some(Value::Array(choices)) = obj.get_mut("choices") {
        for choice in choices.iter_mut() {
            let Some(choice) = choice.as_object_mut() else {
                continue;
            };
            if !choice.contains_key("delta") {
                let text = choice.remove("text");
                let delta = match text.as_ref().and_then(Value::as_str) {
                    Some(t) if !t.is_empty() => json!({ "content": t }),
                    _ => acc.default_delta(),
                };
                choice.insert("delta".to_string(), delta);
            }
            if choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
                .is_some_and(|t| !t.is_empty())
            {
                acc.content_seen = true;
            }
            choice
                .entry("message")
                .or_insert_with(|| json!({ "role": "assistant", "content": "" }));
        }
    }
    obj.insert("object".to_string(), Value::String(CHUNK_OBJECT.to_string()));
    obj.insert("model".to_string(), Value::String(model.to_string()));
}

fn rewrite_typed_event(
    kind: &str,
    event: &Map<String, Value>,
    model: &str,
    acc: &mut StreamAccumulator,
) -> Rewrite {
    match kind {
        "response.created" => {
            if let Some(id) = event
                .get("response")
                .and_then(|r| r.get("id"))
                .and_then(Value::as_str)
            {
                acc.response_id = id.to_string();
            }
            if acc.role_sent {
                return Rewrite::Drop;
            }
            acc.role_sent = true;
            Rewrite::Replace(acc.chunk(model, acc.default_delta(), None))
        }
        "response.output_text.delta" => {
            let text = event.get("delta").and_then(Value::as_str).unwrap_or_default();
            if text.is_empty() {
                return Rewrite::Drop;
            }
            let delta = if acc.role_sent {
                json!({ "content": text })
            } else {
                json!({ "role": "assistant", "content": text })
            };
            acc.role_sent = true;
            acc.content_seen = true;
            Rewrite::Replace(acc.chunk(model, delta, None))
        }
        "response.completed" | "response.incomplete" => {
            let response = event.get("response").cloned().unwrap_or(Value::Null);
            let mut chunk = acc.chunk(model, json!({}), Some(finish_reason_for_status(&response)));
            if let Some(usage) = response.get("usage").and_then(map_usage)
                && let Some(obj) = chunk.as_object_mut()
            {
                obj.insert("usage".to_string(), usage);
            }
            Rewrite::Replace(chunk)
        }
        "response.failed" | "error" => {
            let error = event
                .get("response")
                .and_then(|r| r.get("error"))
                .or_else(|| event.get("error"))
                .unwrap_or(&Value::Null);
            let message = error
                .get("message")
                .or_else(|| event.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("stream failed");
            let code = error
                .get("code")
                .or_else(|| event.get("code"))
                .cloned()
                .unwrap_or_else(|| Value::String("stream_error".to_string()));
            warn!("backend stream reported failure: {}", sanitize_text(message));
            Rewrite::Replace(json!({
                "error": {
                    "message": sanitize_text(message),
                    "type": "azure_openai_error",
                    "code": code,
                }
            }))
        }
        other => {
            debug!("dropping responses stream event {}", other);
            Rewrite::Drop
        }
    }
}

/// Rewrite one frame line by line. `None` drops the frame; `event:` and comment lines are kept.
///
/// Lines that are not valid UTF-8 or whose payload is not JSON are copied through as raw bytes.
pub fn rewrite_frame(
    frame: &RawFrame,
    mode: BackendMode,
    model: &str,
    acc: &mut StreamAccumulator,
) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(frame.bytes.len() + frame.delimiter.len());
    for (i, line) in frame.bytes.split(|b| *b == b'\n').enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        let has_cr = line.last() == Some(&b'\r');
        let bare = if has_cr { &line[..line.len() - 1] } else { line };
        let payload = bare
            .strip_prefix(b"data:")
            .and_then(|p| std::str::from_utf8(p).ok());
        let Some(payload) = payload else {
            out.extend_from_slice(line);
            continue;
        };
        match rewrite_payload(payload, mode, model, acc) {
            Rewrite::Forward => out.extend_from_slice(line),
            Rewrite::Replace(value) => {
                out.extend_from_slice(format!("data: {value}").as_bytes());
                if has_cr {
                    out.push(b'\r');
                }
            }
            Rewrite::Drop => return None,
        }
    }
    out.extend_from_slice(frame.delimiter.as_bytes());
    Some(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Open,
    Closing,
    Closed,
}

struct Pipeline<S> {
    upstream: Pin<Box<S>>,
    framer: SseFramer,
    acc: StreamAccumulator,
    mode: BackendMode,
    model: String,
    phase: StreamPhase,
}

impl<S> Pipeline<S> {
    fn rewrite_all(&mut self, frames: Vec<RawFrame>) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in frames {
            if let Some(bytes) = rewrite_frame(&frame, self.mode, &self.model, &mut self.acc) {
                out.extend_from_slice(&bytes);
            }
        }
        out
    }

    fn tail(&mut self) -> Vec<u8> {
        let frames = self.framer.finish().into_iter().collect();
        let mut out = self.rewrite_all(frames);
        if self.mode == BackendMode::Responses && !self.acc.done_seen {
            out.extend_from_slice(b"data: [DONE]\n\n");
        }
        out
    }
}

/// Rewrite a backend SSE byte stream into chat-completion chunks for `model`.
pub fn rewrite_stream<S, E>(
    upstream: S,
    mode: BackendMode,
    model: String,
) -> impl Stream<Item = Result<Bytes, BridgeError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let pipeline = Pipeline {
        upstream: Box::pin(upstream),
        framer: SseFramer::default(),
        acc: StreamAccumulator::default(),
        mode,
        model,
        phase: StreamPhase::Open,
    };

    stream::unfold(pipeline, |mut p| async move {
        loop {
            match p.phase {
                StreamPhase::Closed => return None,
                StreamPhase::Closing => {
                    p.phase = StreamPhase::Closed;
                    let tail = p.tail();
                    if tail.is_empty() {
                        return None;
                    }
                    return Some((Ok(Bytes::from(tail)), p));
                }
                StreamPhase::Open => match p.upstream.next().await {
                    Some(Ok(chunk)) => {
                        let frames = p.framer.push(&chunk);
                        let out = p.rewrite_all(frames);
                        if !out.is_empty() {
                            return Some((Ok(Bytes::from(out)), p));
                        }
                    }
                    Some(Err(e)) => {
                        p.phase = StreamPhase::Closed;
                        let msg = sanitize_text(&e.to_string());
                        warn!("backend stream read failed: {}", msg);
                        return Some((Err(BridgeError::Transport(msg)), p));
                    }
                    None => {
                        debug!("backend stream ended");
                        p.phase = StreamPhase::Closing;
                    }
                },
            }
        }
    })
}
