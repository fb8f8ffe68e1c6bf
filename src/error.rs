use std::sync::OnceLock;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use regex::Regex;
use thiserror::Error;

use crate::sanitize::sanitize_text;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid request: missing required parameter 'messages'")]
    MissingMessages,
    #[error("Invalid request: missing required parameter 'model'")]
    MissingModel,
    #[error("Invalid request: body is not valid JSON ({0})")]
    InvalidJson(String),
    /// Missing endpoint / credential / deployment, or an unusable endpoint URL.
    #[error("Configuration error: {0}")]
    Config(String),
    /// Non-2xx answer from Azure; `body` is already sanitized.
    #[error("Azure OpenAI API error (status {status}): {body}")]
    Backend { status: u16, body: String },
    #[error("Azure OpenAI request failed: {0}")]
    Transport(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outward error classes; the wire `type` field is derived from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    InvalidRequest,
    Configuration,
    BackendApi,
    Internal,
}

impl ErrorClass {
    pub fn as_type(&self) -> &'static str {
        match self {
            ErrorClass::InvalidRequest => "invalid_request_error",
            ErrorClass::Configuration => "configuration_error",
            ErrorClass::BackendApi => "azure_openai_error",
            ErrorClass::Internal => "internal_error",
        }
    }
}

/// Classify an error by its (sanitized) text.
pub fn classify_error_text(text: &str) -> ErrorClass {
    let lower = text.to_ascii_lowercase();
    // Backend bodies may quote anything, so the backend marker is checked first.
    if lower.contains("azure openai api error") || lower.contains("azure openai request failed") {
        return ErrorClass::BackendApi;
    }
    if lower.starts_with("invalid request") || lower.contains("missing required parameter") {
        return ErrorClass::InvalidRequest;
    }
    if lower.contains("configuration error")
        || lower.contains("not configured")
        || lower.contains("missing endpoint")
        || lower.contains("missing api key")
        || lower.contains("missing deployment")
        || lower.contains("invalid endpoint")
    {
        return ErrorClass::Configuration;
    }
    ErrorClass::Internal
}

fn status_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(status (\d{3})\)").expect("valid status marker regex"))
}

/// Pull the backend status back out of an error text (`... (status 429) ...`).
pub fn extract_status(text: &str) -> Option<u16> {
    let caps = status_marker_re().captures(text)?;
    let code = caps.get(1)?.as_str().parse::<u16>().ok()?;
    (100..=599).contains(&code).then_some(code)
}

impl BridgeError {
    pub fn sanitized_message(&self) -> String {
        sanitize_text(&self.to_string())
    }

    pub fn class(&self) -> ErrorClass {
        classify_error_text(&self.sanitized_message())
    }

    pub fn status_code(&self) -> StatusCode {
        let message = self.sanitized_message();
        match classify_error_text(&message) {
            ErrorClass::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorClass::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorClass::BackendApi => extract_status(&message)
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> String {
        match self {
            BridgeError::MissingMessages | BridgeError::MissingModel => {
                "missing_required_parameter".to_string()
            }
            BridgeError::InvalidJson(_) => "invalid_json".to_string(),
            BridgeError::Config(_) => "configuration_incomplete".to_string(),
            BridgeError::Backend { status, .. } => status.to_string(),
            BridgeError::Transport(_) => "backend_unreachable".to_string(),
            BridgeError::Internal(_) => "internal_error".to_string(),
        }
    }

    /// `{ "error": { "message", "type", "code" } }`
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.sanitized_message(),
                "type": self.class().as_type(),
                "code": self.code(),
            }
        })
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::InvalidJson(e.to_string())
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_body())).into_response()
    }
}
