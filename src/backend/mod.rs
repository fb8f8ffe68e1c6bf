//! The Azure side of the bridge: build the backend call for one resolved descriptor and translate
//! the answer back into chat-completion shape.

use axum::body::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

pub mod request;
pub mod response;
pub mod stream;

use crate::config::{BackendDescriptor, BackendMode};
use crate::error::BridgeError;
use crate::normalize::Conversation;
use crate::sanitize::sanitize_with_secret;

use self::request::{auth_header, backend_url, build_body};

/// One backend call on behalf of one inbound request.
pub struct BackendAdapter<'a> {
    client: &'a Client,
    descriptor: &'a BackendDescriptor,
    requested_model: &'a str,
}

impl<'a> BackendAdapter<'a> {
    pub fn new(client: &'a Client, descriptor: &'a BackendDescriptor, requested_model: &'a str) -> Self {
        Self {
            client,
            descriptor,
            requested_model,
        }
    }

    /// Every reqwest failure goes through here so the configured key never reaches an error body.
    fn transport_error(&self, err: reqwest::Error) -> BridgeError {
        BridgeError::Transport(sanitize_with_secret(&err.to_string(), &self.descriptor.api_key))
    }

    async fn send(
        &self,
        conversation: &Conversation,
        params: &Map<String, Value>,
        stream: bool,
    ) -> Result<reqwest::Response, BridgeError> {
        let url = backend_url(self.descriptor)?;
        let (auth_name, auth_value) = auth_header(self.descriptor)?;
        let body = build_body(self.descriptor, conversation, params, stream);
        info!(
            "forwarding model={} to deployment={} mode={} stream={} turns={}",
            self.requested_model,
            self.descriptor.deployment,
            self.descriptor.mode.as_str(),
            stream,
            conversation.len()
        );

        let resp = self
            .client
            .post(url)
            .header(auth_name, auth_value)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let body = sanitize_with_secret(&text, &self.descriptor.api_key);
        warn!(
            "backend returned status {} for deployment {}: {}",
            status.as_u16(),
            self.descriptor.deployment,
            body
        );
        Err(BridgeError::Backend {
            status: status.as_u16(),
            body,
        })
    }

    /// Blocking call; the whole backend body is buffered before translation.
    pub async fn complete(
        &self,
        conversation: &Conversation,
        params: &Map<String, Value>,
    ) -> Result<Value, BridgeError> {
        let resp = self.send(conversation, params, false).await?;
        let bytes = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        let body: Value = serde_json::from_slice(&bytes).map_err(|e| {
            BridgeError::Internal(format!("backend returned a non-JSON body: {e}"))
        })?;
        debug!("backend answered with {} bytes", bytes.len());

        Ok(match self.descriptor.mode {
            BackendMode::Chat => {
                let mut body = body;
                if let Some(obj) = body.as_object_mut() {
                    obj.insert(
                        "model".to_string(),
                        Value::String(self.requested_model.to_string()),
                    );
                }
                body
            }
            BackendMode::Responses => response::to_chat_completion(&body, self.requested_model),
        })
    }

    /// Streaming call; errors before the first byte are returned, later ones end the stream.
    pub async fn open_stream(
        &self,
        conversation: &Conversation,
        params: &Map<String, Value>,
    ) -> Result<BoxStream<'static, Result<Bytes, BridgeError>>, BridgeError> {
        let resp = self.send(conversation, params, true).await?;
        Ok(stream::rewrite_stream(
            resp.bytes_stream(),
            self.descriptor.mode,
            self.requested_model.to_string(),
        )
        .boxed())
    }
}
