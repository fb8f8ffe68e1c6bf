use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

/// Field-name fragments whose values are never echoed to callers or logs.
const SENSITIVE_TERMS: &[&str] = &["key", "token", "secret", "password", "authorization"];

/// Token counters (`max_tokens`, `prompt_tokens`, ...) share the `token` fragment but are not secrets.
fn is_token_counter(name_lower: &str) -> bool {
    name_lower.ends_with("tokens") || name_lower.ends_with("tokens_details")
}

pub fn is_sensitive_field(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if is_token_counter(&lower) {
        return false;
    }
    SENSITIVE_TERMS.iter().any(|t| lower.contains(t))
}

fn key_shaped_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Za-z]{2,8}-[A-Za-z0-9_-]{20,}").expect("valid key-shaped regex")
    })
}

fn bearer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+").expect("valid bearer regex"))
}

fn json_pair_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""([A-Za-z0-9_.-]*)"(\s*:\s*)"(?:[^"\\]|\\.)*""#).expect("valid json pair regex")
    })
}

fn assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([A-Za-z0-9_.-]+)(\s*[=:]\s*)([^\s&,;'\x22]+)").expect("valid assignment regex")
    })
}

/// Partially masked form of a credential: keeps a short prefix for recognition.
pub fn mask_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.chars().count() <= 8 {
        return "****".to_string();
    }
    let prefix: String = trimmed.chars().take(4).collect();
    format!("{prefix}****")
}

/// Redact credentials from free-form text (error bodies, transport errors, log lines).
pub fn sanitize_text(text: &str) -> String {
    let out = bearer_re().replace_all(text, format!("Bearer {REDACTED}").as_str());

    let out = json_pair_re().replace_all(&out, |caps: &Captures| {
        if is_sensitive_field(&caps[1]) {
            format!("\"{}\"{}\"{REDACTED}\"", &caps[1], &caps[2])
        } else {
            caps[0].to_string()
        }
    });

    let out = assignment_re().replace_all(&out, |caps: &Captures| {
        let value = &caps[3];
        if is_sensitive_field(&caps[1])
            && !value.eq_ignore_ascii_case("bearer")
            && !value.starts_with("[REDACTED")
            && !value.starts_with('"')
        {
            format!("{}{}{REDACTED}", &caps[1], &caps[2])
        } else {
            caps[0].to_string()
        }
    });

    key_shaped_re()
        .replace_all(&out, |caps: &Captures| mask_secret(&caps[0]))
        .into_owned()
}

/// Like [`sanitize_text`], and additionally scrubs every literal occurrence of `secret`.
pub fn sanitize_with_secret(text: &str, secret: &str) -> String {
    let scrubbed = if secret.trim().len() >= 4 {
        text.replace(secret.trim(), REDACTED)
    } else {
        text.to_string()
    };
    sanitize_text(&scrubbed)
}

/// Recursively redact sensitive fields of a JSON document.
pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_field(k) && !v.is_null() {
                        Value::String(REDACTED.to_string())
                    } else {
                        sanitize_value(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::String(s) => Value::String(sanitize_text(s)),
        other => other.clone(),
    }
}
