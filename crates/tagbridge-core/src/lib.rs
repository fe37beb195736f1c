pub mod decode;
pub mod extract;
pub mod prompt;
pub mod request;
pub mod response;

use std::{fmt, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use secrecy::{ExposeSecret, SecretString};
use tagbridge_contracts::{
    ChatRequest, ChatResponse, GenerateRequest, GenerateResponse, Message, UpstreamPayload,
};
use tracing::{Instrument, Span, info, info_span};
use uuid::Uuid;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
}

/// Bearer token forwarded to the upstream. Only the transport reads it.
pub struct Credential(SecretString);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// One server-sent event from the upstream, reduced to its `data` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEvent {
    pub data: String,
}

pub type UpstreamEventStream = Pin<Box<dyn Stream<Item = Result<UpstreamEvent, CoreError>> + Send>>;
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, CoreError>> + Send>>;
pub type ChatResponseStream = Pin<Box<dyn Stream<Item = Result<ChatResponse, CoreError>> + Send>>;
pub type GenerateResponseStream =
    Pin<Box<dyn Stream<Item = Result<GenerateResponse, CoreError>> + Send>>;

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Sends a non-streaming request and returns the raw response body.
    async fn complete(
        &self,
        payload: &UpstreamPayload,
        credential: Option<&Credential>,
    ) -> Result<String, CoreError>;

    /// Opens a streaming request. The returned stream ends with `None` on a
    /// clean close and yields `Err` on a mid-stream fault.
    async fn complete_stream(
        &self,
        payload: &UpstreamPayload,
        credential: Option<&Credential>,
    ) -> Result<UpstreamEventStream, CoreError>;
}

pub struct BridgeEngine {
    upstream: Arc<dyn UpstreamClient>,
    supported_models: Vec<String>,
}

impl BridgeEngine {
    pub fn new(upstream: Arc<dyn UpstreamClient>) -> Self {
        Self { upstream, supported_models: Vec::new() }
    }

    /// Restricts accepted models. An empty list accepts any model.
    pub fn with_supported_models(mut self, models: Vec<String>) -> Self {
        self.supported_models = models;
        self
    }

    pub fn supported_models(&self) -> &[String] {
        &self.supported_models
    }

    pub async fn chat(
        &self,
        request: ChatRequest,
        credential: Option<&Credential>,
    ) -> Result<ChatResponse, CoreError> {
        let span = request_span("chat", &request.model);
        async move {
            let message = self.complete_message(request, credential).await?;
            Ok(response::chat_response(extract::resolve_message(message)))
        }
        .instrument(span)
        .await
    }

    pub async fn chat_stream(
        &self,
        request: ChatRequest,
        credential: Option<&Credential>,
    ) -> Result<ChatResponseStream, CoreError> {
        let span = request_span("chat_stream", &request.model);
        let deltas = self.open_stream(request, credential).instrument(span.clone()).await?;
        let extracted: MessageStream = Box::pin(extract::extract_stream(deltas));
        Ok(Box::pin(in_span(response::chat_stream_envelope(extracted), span)))
    }

    pub async fn generate(
        &self,
        request: GenerateRequest,
        credential: Option<&Credential>,
    ) -> Result<GenerateResponse, CoreError> {
        let span = request_span("generate", &request.model);
        async move {
            let message = self.complete_message(request.into_chat_request(), credential).await?;
            Ok(response::generate_response(message))
        }
        .instrument(span)
        .await
    }

    pub async fn generate_stream(
        &self,
        request: GenerateRequest,
        credential: Option<&Credential>,
    ) -> Result<GenerateResponseStream, CoreError> {
        let span = request_span("generate_stream", &request.model);
        let deltas = self
            .open_stream(request.into_chat_request(), credential)
            .instrument(span.clone())
            .await?;
        Ok(Box::pin(in_span(response::generate_stream_envelope(deltas), span)))
    }

    async fn complete_message(
        &self,
        request: ChatRequest,
        credential: Option<&Credential>,
    ) -> Result<Message, CoreError> {
        self.validate(&request)?;
        let mut payload = request::translate_request(request);
        payload.stream = false;
        log_accepted(&payload);
        let body = self.upstream.complete(&payload, credential).await?;
        decode::decode_completion(&body)
    }

    async fn open_stream(
        &self,
        request: ChatRequest,
        credential: Option<&Credential>,
    ) -> Result<MessageStream, CoreError> {
        self.validate(&request)?;
        let mut payload = request::translate_request(request);
        payload.stream = true;
        log_accepted(&payload);
        let events = self.upstream.complete_stream(&payload, credential).await?;
        Ok(decode::decode_event_stream(events))
    }

    fn validate(&self, request: &ChatRequest) -> Result<(), CoreError> {
        if request.model.trim().is_empty() {
            return Err(CoreError::Validation("model must not be empty".to_string()));
        }
        if !self.supported_models.is_empty() && !self.supported_models.contains(&request.model) {
            return Err(CoreError::Validation(format!("model `{}` is not supported", request.model)));
        }
        Ok(())
    }
}

fn request_span(operation: &'static str, model: &str) -> Span {
    info_span!("bridge_request", request_id = %Uuid::new_v4(), operation = operation, model = %model)
}

fn log_accepted(payload: &UpstreamPayload) {
    info!(
        event = "bridge.request.accepted",
        stream = payload.stream,
        messages = payload.messages.len()
    );
}

// Polls every item inside `span` so logs from the lazy pipeline keep the request id.
fn in_span<S>(inner: S, span: Span) -> impl Stream<Item = S::Item> + Send
where
    S: Stream + Send + 'static,
    S::Item: Send,
{
    stream::unfold((Box::pin(inner), span), |(mut inner, span)| async move {
        let item = inner.next().instrument(span.clone()).await?;
        Some((item, (inner, span)))
    })
}
