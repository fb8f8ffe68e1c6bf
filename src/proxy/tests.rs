use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::Json;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::Response;
use axum::routing::post;
use futures_util::stream;
use pretty_assertions::assert_eq;
use reqwest::Client;
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::config::{BackendMode, EnvSnapshot, ModelConfig, ProxyConfig};
use crate::proxy::ProxyService;

const TEST_KEY: &str = "sk-testkey0123456789abcdefghij";

type Seen = Arc<Mutex<Vec<(HeaderMap, Value)>>>;

fn spawn_axum_server(app: axum::Router) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    listener.set_nonblocking(true).expect("nonblocking");
    let listener = tokio::net::TcpListener::from_std(listener).expect("to tokio listener");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, handle)
}

fn model_entry(addr: std::net::SocketAddr, deployment: &str, mode: BackendMode) -> ModelConfig {
    ModelConfig {
        endpoint: Some(format!("http://{addr}/")),
        api_key: Some(TEST_KEY.to_string()),
        deployment: Some(deployment.to_string()),
        mode: Some(mode),
        ..Default::default()
    }
}

fn make_proxy(models: Vec<(&str, ModelConfig)>) -> ProxyService {
    let mut cfg = ProxyConfig {
        version: Some(1),
        ..Default::default()
    };
    for (name, entry) in models {
        cfg.models.insert(name.to_string(), entry);
    }
    ProxyService::new(Client::new(), Arc::new(cfg), EnvSnapshot::default())
}

/// Mock Azure endpoint answering every POST on `path` with `status` and a JSON body.
fn json_backend(path: &str, status: StatusCode, reply: Value) -> (axum::Router, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    let app = axum::Router::new().route(
        path,
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            seen_in.lock().expect("lock").push((headers, body));
            let reply = reply.clone();
            async move { (status, Json(reply)) }
        }),
    );
    (app, seen)
}

/// Mock Azure endpoint streaming the given SSE chunks.
fn sse_backend(path: &str, chunks: Vec<&'static str>) -> (axum::Router, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    let app = axum::Router::new().route(
        path,
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            seen_in.lock().expect("lock").push((headers, body));
            let chunks = chunks.clone();
            async move {
                let s = stream::iter(
                    chunks
                        .into_iter()
                        .map(|c| Ok::<Bytes, Infallible>(Bytes::from_static(c.as_bytes()))),
                );
                let mut resp = Response::new(Body::from_stream(s));
                *resp.status_mut() = StatusCode::OK;
                resp.headers_mut().insert(
                    axum::http::header::CONTENT_TYPE,
                    HeaderValue::from_static("text/event-stream"),
                );
                resp
            }
        }),
    );
    (app, seen)
}

async fn post_chat(addr: std::net::SocketAddr, body: Value) -> reqwest::Response {
    Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .header("origin", "http://localhost:5173")
        .json(&body)
        .send()
        .await
        .expect("send")
}

#[tokio::test]
async fn chat_mode_blocking_call_returns_requested_model() {
    let (backend, seen) = json_backend(
        "/openai/deployments/gpt4o-prod/chat/completions",
        StatusCode::OK,
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt4o-prod",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "pong" }, "finish_reason": "stop" }],
        }),
    );
    let (b_addr, b_handle) = spawn_axum_server(backend);
    let proxy = make_proxy(vec![("gpt-4o", model_entry(b_addr, "gpt4o-prod", BackendMode::Chat))]);
    let (p_addr, p_handle) = spawn_axum_server(crate::proxy::router(proxy));

    let resp = post_chat(
        p_addr,
        json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": "ping" }],
            "temperature": 0.1,
            "stream_options": { "include_usage": true },
        }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["choices"][0]["message"]["content"], "pong");

    let seen = seen.lock().expect("lock");
    let (headers, sent) = &seen[0];
    assert_eq!(
        headers.get("api-key").and_then(|v| v.to_str().ok()),
        Some(TEST_KEY)
    );
    assert_eq!(
        sent,
        &json!({
            "temperature": 0.1,
            "messages": [{ "role": "user", "content": "ping" }],
        })
    );

    p_handle.abort();
    b_handle.abort();
}

#[tokio::test]
async fn responses_mode_blocking_call_is_rebuilt_as_chat_completion() {
    let (backend, seen) = json_backend(
        "/openai/responses",
        StatusCode::OK,
        json!({
            "id": "resp_abc",
            "status": "completed",
            "output_text": "hello",
            "usage": { "input_tokens": 9, "output_tokens": 3 },
        }),
    );
    let (b_addr, b_handle) = spawn_axum_server(backend);
    let mut entry = model_entry(b_addr, "codex-dep", BackendMode::Responses);
    entry.mode = None;
    let proxy = make_proxy(vec![("codex-x", entry)]);
    let (p_addr, p_handle) = spawn_axum_server(crate::proxy::router(proxy));

    let resp = post_chat(
        p_addr,
        json!({ "model": "codex-x", "input": "Say hi", "stream": false, "max_tokens": 64 }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "codex-x");
    assert_eq!(body["choices"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 12);

    let seen = seen.lock().expect("lock");
    let (headers, sent) = &seen[0];
    assert_eq!(
        headers.get("authorization").and_then(|v| v.to_str().ok()),
        Some(format!("Bearer {TEST_KEY}").as_str())
    );
    assert_eq!(sent["model"], "codex-dep");
    assert_eq!(sent["max_output_tokens"], 64);
    assert_eq!(
        sent["input"],
        json!([{ "role": "user", "content": [{ "type": "input_text", "text": "Say hi" }] }])
    );

    p_handle.abort();
    b_handle.abort();
}

#[tokio::test]
async fn backend_error_status_is_passed_through_without_leaking_the_key() {
    let (backend, _seen) = json_backend(
        "/openai/deployments/gpt4o-prod/chat/completions",
        StatusCode::TOO_MANY_REQUESTS,
        json!({ "error": { "message": format!("quota exceeded for {TEST_KEY}") } }),
    );
    let (b_addr, b_handle) = spawn_axum_server(backend);
    let proxy = make_proxy(vec![("gpt-4o", model_entry(b_addr, "gpt4o-prod", BackendMode::Chat))]);
    let (p_addr, p_handle) = spawn_axum_server(crate::proxy::router(proxy));

    let resp = post_chat(
        p_addr,
        json!({ "model": "gpt-4o", "messages": [{ "role": "user", "content": "hi" }] }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let text = resp.text().await.expect("text");
    assert!(!text.contains(TEST_KEY), "key leaked: {text}");
    let body: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(body["error"]["type"], "azure_openai_error");
    assert_eq!(body["error"]["code"], "429");

    p_handle.abort();
    b_handle.abort();
}

#[tokio::test]
async fn unreachable_backend_is_a_sanitized_500() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let dead_addr = closed.local_addr().expect("local_addr");
    drop(closed);
    let proxy = make_proxy(vec![("gpt-4o", model_entry(dead_addr, "gpt4o-prod", BackendMode::Chat))]);
    let (p_addr, p_handle) = spawn_axum_server(crate::proxy::router(proxy));

    let resp = post_chat(
        p_addr,
        json!({ "model": "gpt-4o", "messages": [{ "role": "user", "content": "hi" }] }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let text = resp.text().await.expect("text");
    assert!(!text.contains(TEST_KEY), "key leaked: {text}");
    let body: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(body["error"]["code"], "backend_unreachable");

    p_handle.abort();
}

#[tokio::test]
async fn chat_stream_overwrites_model_and_forwards_done() {
    let (backend, seen) = sse_backend(
        "/openai/deployments/gpt4o-prod/chat/completions",
        vec![
            "data: {\"model\":\"gpt4o-prod\",\"choices\":[{\"delta\":{\"content\":\"po",
            "\"}}]}\n\ndata: {\"model\":\"gpt4o-prod\",\"choices\":[{\"delta\":{\"content\":\"ng\"}}]}\n\n",
            "data: [DONE]\n\n",
        ],
    );
    let (b_addr, b_handle) = spawn_axum_server(backend);
    let proxy = make_proxy(vec![("gpt-4o", model_entry(b_addr, "gpt4o-prod", BackendMode::Chat))]);
    let (p_addr, p_handle) = spawn_axum_server(crate::proxy::router(proxy));

    let resp = post_chat(
        p_addr,
        json!({ "model": "gpt-4o", "messages": [{ "role": "user", "content": "ping" }], "stream": true }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    let text = resp.text().await.expect("text");
    let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
    assert_eq!(frames.len(), 3, "{text}");
    for frame in &frames[..2] {
        let v: Value = serde_json::from_str(frame.trim_start_matches("data: ")).expect("json frame");
        assert_eq!(v["model"], "gpt-4o");
    }
    assert_eq!(frames[2], "data: [DONE]");
    assert_eq!(seen.lock().expect("lock")[0].1["stream"], true);

    p_handle.abort();
    b_handle.abort();
}

#[tokio::test]
async fn responses_stream_events_become_chat_chunks() {
    let (backend, _seen) = sse_backend(
        "/openai/responses",
        vec![
            "event: response.created\ndata: {\"type\":\"response.created\",\"response\":{\"id\":\"resp_7\"}}\n\n",
            "event: response.output_text.delta\ndata: {\"type\":\"response.output_text.delta\",\"delta\":\"Hi\"}\n\n",
            "event: response.output_text.done\ndata: {\"type\":\"response.output_text.done\",\"text\":\"Hi\"}\n\n",
            "event: response.completed\ndata: {\"type\":\"response.completed\",\"response\":{\"status\":\"completed\",\"usage\":{\"input_tokens\":2,\"output_tokens\":1}}}\n\n",
        ],
    );
    let (b_addr, b_handle) = spawn_axum_server(backend);
    let proxy = make_proxy(vec![("codex-x", model_entry(b_addr, "codex-dep", BackendMode::Responses))]);
    let (p_addr, p_handle) = spawn_axum_server(crate::proxy::router(proxy));

    let resp = post_chat(p_addr, json!({ "model": "codex-x", "input": "hello", "stream": true })).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let text = resp.text().await.expect("text");
    let chunks: Vec<Value> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .filter(|p| *p != "[DONE]")
        .map(|p| serde_json::from_str(p).expect("json chunk"))
        .collect();

    assert_eq!(chunks.len(), 3, "{text}");
    assert!(chunks.iter().all(|c| c["id"] == "resp_7" && c["model"] == "codex-x"));
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "Hi");
    assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
    assert_eq!(chunks[2]["usage"]["total_tokens"], 3);
    assert!(!text.contains("response.output_text.done"), "{text}");
    assert!(text.ends_with("data: [DONE]\n\n"), "{text}");

    p_handle.abort();
    b_handle.abort();
}

#[tokio::test]
async fn stream_backend_error_is_a_single_json_error() {
    let (backend, _seen) = json_backend(
        "/openai/responses",
        StatusCode::SERVICE_UNAVAILABLE,
        json!({ "error": { "message": "overloaded" } }),
    );
    let (b_addr, b_handle) = spawn_axum_server(backend);
    let proxy = make_proxy(vec![("codex-x", model_entry(b_addr, "codex-dep", BackendMode::Responses))]);
    let (p_addr, p_handle) = spawn_axum_server(crate::proxy::router(proxy));

    let resp = post_chat(p_addr, json!({ "model": "codex-x", "input": "hello", "stream": true })).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["type"], "azure_openai_error");
    assert!(
        body["error"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("overloaded"))
    );

    p_handle.abort();
    b_handle.abort();
}

#[tokio::test]
async fn malformed_requests_are_rejected_with_400() {
    let proxy = make_proxy(Vec::new());
    let (p_addr, p_handle) = spawn_axum_server(crate::proxy::router(proxy));

    let resp = post_chat(p_addr, json!({ "messages": [{ "role": "user", "content": "hi" }] })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(
        body["error"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("'model'"))
    );

    let resp = post_chat(p_addr, json!({ "model": "gpt-4o", "messages": [] })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert!(
        body["error"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("'messages'"))
    );

    let resp = Client::new()
        .post(format!("http://{p_addr}/chat/completions"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    p_handle.abort();
}

#[tokio::test]
async fn unconfigured_or_incomplete_models_are_configuration_errors() {
    let incomplete = ModelConfig {
        endpoint: Some("https://res.openai.azure.com".to_string()),
        api_key: Some(TEST_KEY.to_string()),
        ..Default::default()
    };
    let proxy = make_proxy(vec![("half-done", incomplete)]);
    let (p_addr, p_handle) = spawn_axum_server(crate::proxy::router(proxy));

    for model in ["nobody-knows-me", "half-done"] {
        let resp = post_chat(
            p_addr,
            json!({ "model": model, "messages": [{ "role": "user", "content": "hi" }] }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["error"]["type"], "configuration_error");
    }

    p_handle.abort();
}

#[tokio::test]
async fn models_endpoint_lists_configured_names() {
    let addr: std::net::SocketAddr = "127.0.0.1:9".parse().expect("addr");
    let proxy = make_proxy(vec![
        ("gpt-4o", model_entry(addr, "gpt4o-prod", BackendMode::Chat)),
        ("codex-x", model_entry(addr, "codex-dep", BackendMode::Responses)),
    ]);
    let app = crate::proxy::router(proxy);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .expect("data")
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["codex-x", "gpt-4o"]);
    assert_eq!(body["data"][0]["owned_by"], "azure-openai");
    assert_eq!(body["data"][0]["object"], "model");
}

#[tokio::test]
async fn cors_preflight_is_answered() {
    let app = crate::proxy::router(make_proxy(Vec::new()));
    let resp = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/v1/chat/completions")
                .header("origin", "http://localhost:5173")
                .header("access-control-request-method", "POST")
                .header("access-control-request-headers", "content-type,api-key")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert!(resp.status().is_success());
    let headers = resp.headers();
    assert_eq!(
        headers
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    let methods = headers
        .get("access-control-allow-methods")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(methods.contains("POST") && methods.contains("OPTIONS"), "{methods}");
    let allowed = headers
        .get("access-control-allow-headers")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    assert!(allowed.contains("api-key"), "{allowed}");
}

#[tokio::test]
async fn config_endpoint_masks_credentials() {
    let addr: std::net::SocketAddr = "127.0.0.1:9".parse().expect("addr");
    let app = crate::proxy::router(make_proxy(vec![(
        "gpt-4o",
        model_entry(addr, "gpt4o-prod", BackendMode::Chat),
    )]));

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/config")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    let text = String::from_utf8_lossy(&bytes);
    assert!(!text.contains(TEST_KEY), "{text}");
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["models"]["gpt-4o"]["api_key"], "sk-t****");
}

#[tokio::test]
async fn config_update_rejects_invalid_endpoints() {
    let app = crate::proxy::router(make_proxy(Vec::new()));
    let payload = json!({
        "models": { "broken": { "endpoint": "not a url", "api_key": "k", "deployment": "d" } }
    });
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/config")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["error"]["type"], "configuration_error");
}

async fn oneshot_json(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.expect("response");
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, serde_json::from_slice(&bytes).expect("json"))
}

#[tokio::test]
async fn config_update_keeps_masked_keys_and_swaps_the_live_table() {
    let (backend, seen) = json_backend(
        "/openai/deployments/gpt4o-prod/chat/completions",
        StatusCode::OK,
        json!({ "choices": [{ "index": 0, "message": { "role": "assistant", "content": "ok" } }] }),
    );
    let (b_addr, b_handle) = spawn_axum_server(backend);
    let app = crate::proxy::router(make_proxy(vec![(
        "gpt-4o",
        model_entry(b_addr, "gpt4o-prod", BackendMode::Chat),
    )]));
    let get_config = || {
        Request::builder()
            .uri("/api/config")
            .body(Body::empty())
            .expect("request")
    };

    let (status, mut masked) = oneshot_json(&app, get_config()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(masked["models"]["gpt-4o"]["api_key"], "sk-t****");
    masked["models"]["extra"] = json!({
        "endpoint": format!("http://{b_addr}"),
        "api_key": "extra-key-value",
        "deployment": "extra-dep",
    });

    let (status, saved) = oneshot_json(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/config")
            .header("content-type", "application/json")
            .body(Body::from(masked.to_string()))
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{saved}");
    assert_eq!(saved["saved"], true);
    assert_eq!(saved["models"], 2);

    let on_disk = crate::config::load_config().await.expect("load saved config");
    assert_eq!(on_disk.models["gpt-4o"].api_key.as_deref(), Some(TEST_KEY));
    assert_eq!(on_disk.models["extra"].deployment.as_deref(), Some("extra-dep"));

    let (_, reread) = oneshot_json(&app, get_config()).await;
    assert_eq!(reread["models"]["gpt-4o"]["api_key"], "sk-t****");
    assert_eq!(reread["models"]["extra"]["deployment"], "extra-dep");

    let (status, completion) = oneshot_json(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "model": "gpt-4o", "messages": [{ "role": "user", "content": "hi" }] })
                    .to_string(),
            ))
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{completion}");
    assert_eq!(completion["model"], "gpt-4o");
    let seen = seen.lock().expect("lock");
    assert_eq!(
        seen[0].0.get("api-key").and_then(|v| v.to_str().ok()),
        Some(TEST_KEY)
    );

    b_handle.abort();
}

#[tokio::test]
async fn health_reports_ok() {
    let app = crate::proxy::router(make_proxy(Vec::new()));
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
}
