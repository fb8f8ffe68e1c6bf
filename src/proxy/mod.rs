use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method, Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use reqwest::Client;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tracing::{Span, info, instrument, warn};

mod runtime_config;
#[cfg(test)]
mod tests;

use crate::backend::BackendAdapter;
use crate::backend::request::passthrough_params;
use crate::backend::response::unix_now;
use crate::config::{EnvSnapshot, ProxyConfig, list_models, resolve_backend, validate_endpoint};
use crate::error::BridgeError;
use crate::normalize::normalize_request;

use self::runtime_config::RuntimeConfig;

pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Marker left by `mask_secret`; a key containing it was echoed back from `GET /api/config`.
const MASK_MARKER: &str = "****";

#[derive(Clone)]
pub struct ProxyService {
    pub client: Client,
    config: Arc<RuntimeConfig>,
    env: Arc<EnvSnapshot>,
}

impl ProxyService {
    pub fn new(client: Client, config: Arc<ProxyConfig>, env: EnvSnapshot) -> Self {
        Self {
            client,
            config: Arc::new(RuntimeConfig::new(config)),
            env: Arc::new(env),
        }
    }

    async fn current_config(&self) -> Arc<ProxyConfig> {
        self.config.maybe_reload_from_disk().await;
        self.config.snapshot().await
    }
}

#[instrument(skip_all, fields(path = %req.uri().path(), model = tracing::field::Empty))]
pub async fn handle_chat_completions(proxy: ProxyService, req: Request<Body>) -> Response<Body> {
    let start = Instant::now();
    match chat_completions(&proxy, req).await {
        Ok(resp) => {
            info!(
                "chat completion answered {} in {}ms",
                resp.status().as_u16(),
                start.elapsed().as_millis()
            );
            resp
        }
        Err(err) => {
            let status = err.status_code();
            warn!(
                "chat completion failed with {} in {}ms: {}",
                status.as_u16(),
                start.elapsed().as_millis(),
                err.sanitized_message()
            );
            err.into_response()
        }
    }
}

async fn chat_completions(
    proxy: &ProxyService,
    req: Request<Body>,
) -> Result<Response<Body>, BridgeError> {
    let raw = to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| BridgeError::InvalidJson(format!("failed to read request body: {e}")))?;
    let body: Value = serde_json::from_slice(&raw)?;

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or(BridgeError::MissingModel)?;
    Span::current().record("model", model);

    let conversation = normalize_request(&body).ok_or(BridgeError::MissingMessages)?;

    let cfg = proxy.current_config().await;
    let descriptor = resolve_backend(model, &proxy.env, &cfg)?;
    let params = passthrough_params(&body);
    let adapter = BackendAdapter::new(&proxy.client, &descriptor, model);

    let is_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if !is_stream {
        let completion = adapter.complete(&conversation, &params).await?;
        return Ok(Json(completion).into_response());
    }

    let stream = adapter.open_stream(&conversation, &params).await?;
    let mut resp = Response::new(Body::from_stream(stream));
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(resp)
}

async fn list_models_handler(proxy: ProxyService) -> Json<Value> {
    let cfg = proxy.current_config().await;
    let created = unix_now();
    let data = list_models(&proxy.env, &cfg)
        .into_iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "created": created,
                "owned_by": "azure-openai",
            })
        })
        .collect::<Vec<_>>();
    Json(json!({ "object": "list", "data": data }))
}

async fn get_config(proxy: ProxyService) -> Json<ProxyConfig> {
    let cfg = proxy.current_config().await;
    Json(cfg.masked())
}

/// Replace the persisted model table. Masked keys echoed back by the UI keep the stored value.
async fn set_config(proxy: ProxyService, Json(incoming): Json<ProxyConfig>) -> Response<Body> {
    let current = proxy.current_config().await;
    let mut next = current.as_ref().clone();
    next.models.clear();

    for (name, mut entry) in incoming.models {
        if entry
            .api_key
            .as_deref()
            .is_some_and(|k| k.contains(MASK_MARKER))
        {
            entry.api_key = current.models.get(&name).and_then(|e| e.api_key.clone());
        }
        if let Some(endpoint) = entry.endpoint.as_deref()
            && let Err(reason) = validate_endpoint(endpoint)
        {
            let err = BridgeError::Config(format!(
                "invalid endpoint for model '{name}': {reason}"
            ));
            return (StatusCode::BAD_REQUEST, Json(err.to_body())).into_response();
        }
        next.models.insert(name, entry);
    }

    match crate::config::save_config(&next).await {
        Ok(path) => {
            let count = next.models.len();
            proxy.config.replace(next).await;
            info!("saved {} models to {:?}", count, path);
            Json(json!({
                "saved": true,
                "path": path.display().to_string(),
                "models": count,
            }))
            .into_response()
        }
        Err(e) => {
            let err = BridgeError::Internal(format!("failed to save config: {e}"));
            warn!("{}", err.sanitized_message());
            err.into_response()
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("api-key"),
        ])
}

pub fn router(proxy: ProxyService) -> Router {
    let p0 = proxy.clone();
    let p1 = proxy.clone();
    let p2 = proxy.clone();
    let p3 = proxy.clone();
    let p4 = proxy.clone();
    let p5 = proxy;

    Router::new()
        .route(
            "/v1/chat/completions",
            post(move |req| handle_chat_completions(p0.clone(), req)),
        )
        .route(
            "/chat/completions",
            post(move |req| handle_chat_completions(p1.clone(), req)),
        )
        .route("/v1/models", get(move || list_models_handler(p2.clone())))
        .route("/models", get(move || list_models_handler(p3.clone())))
        .route(
            "/api/config",
            get(move || get_config(p4.clone())).post(move |payload| set_config(p5.clone(), payload)),
        )
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors_layer())
}
