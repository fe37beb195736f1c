use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use tagbridge_contracts::UpstreamPayload;
use tagbridge_core::{CoreError, Credential, UpstreamClient, UpstreamEvent, UpstreamEventStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://chat.qwen.ai/api";
pub const UPSTREAM_CHAT_PATH: &str = "chat/completions";

const ERROR_BODY_PREVIEW_CHARS: usize = 512;

/// Chat-completions transport over reqwest.
///
/// A request-scoped credential wins over the configured default. Requests
/// beyond `max_inflight` are rejected immediately instead of queueing.
pub struct HttpUpstreamClient {
    base_url: String,
    default_credential: Option<Credential>,
    http_client: Client,
    max_inflight: Option<Arc<Semaphore>>,
}

impl HttpUpstreamClient {
    pub fn build_http_client(timeout_seconds: u64) -> Result<Client, CoreError> {
        Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|err| CoreError::Upstream(format!("upstream client init failed: {err}")))
    }

    pub fn new_with_http_client(
        base_url: String,
        default_credential: Option<Credential>,
        http_client: Client,
        max_inflight: Option<usize>,
    ) -> Self {
        let max_inflight = max_inflight.map(Semaphore::new).map(Arc::new);
        Self { base_url, default_credential, http_client, max_inflight }
    }

    pub fn new(
        base_url: String,
        default_credential: Option<Credential>,
        timeout_seconds: u64,
        max_inflight: Option<usize>,
    ) -> Result<Self, CoreError> {
        let http_client = Self::build_http_client(timeout_seconds)?;
        Ok(Self::new_with_http_client(base_url, default_credential, http_client, max_inflight))
    }

    fn build_url(&self, path: &str) -> Result<String, CoreError> {
        let base_url = self.base_url.trim();
        if base_url.is_empty() {
            return Err(CoreError::Upstream("upstream base_url is not configured".to_string()));
        }
        Ok(format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/')))
    }

    fn acquire_permit(&self) -> Result<Option<OwnedSemaphorePermit>, CoreError> {
        self.max_inflight
            .as_ref()
            .map(|semaphore| {
                semaphore.clone().try_acquire_owned().map_err(|_| {
                    CoreError::Upstream(
                        "upstream overloaded: max in-flight limit reached".to_string(),
                    )
                })
            })
            .transpose()
    }

    fn build_request(
        &self,
        url: &str,
        payload: &UpstreamPayload,
        credential: Option<&Credential>,
    ) -> RequestBuilder {
        let credential = credential.or(self.default_credential.as_ref());
        info!(
            event = "upstream.request.sent",
            url = %url,
            model = %payload.model,
            stream = payload.stream,
            messages = payload.messages.len(),
            authenticated = credential.is_some()
        );
        let mut request = self.http_client.post(url).json(payload);
        if let Some(credential) = credential.filter(|c| !c.expose().trim().is_empty()) {
            request = request.bearer_auth(credential.expose());
        }
        if payload.stream {
            request = request.header(reqwest::header::ACCEPT, "text/event-stream");
        }
        request
    }

    async fn send(
        &self,
        payload: &UpstreamPayload,
        credential: Option<&Credential>,
    ) -> Result<Response, CoreError> {
        let url = self.build_url(UPSTREAM_CHAT_PATH)?;
        let response = self
            .build_request(&url, payload, credential)
            .send()
            .await
            .map_err(|err| CoreError::Upstream(format!("upstream request failed: {err}")))?;
        let status = response.status();
        info!(event = "upstream.response.status", status = status.as_u16(), stream = payload.stream);
        if status.is_success() {
            return Ok(response);
        }

        let preview = error_body_preview(response.text().await);
        warn!(event = "upstream.response.error", status = status.as_u16(), body = %preview);
        Err(CoreError::Upstream(format!("upstream returned status {status}: {preview}")))
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn complete(
        &self,
        payload: &UpstreamPayload,
        credential: Option<&Credential>,
    ) -> Result<String, CoreError> {
        let _permit = self.acquire_permit()?;
        let response = self.send(payload, credential).await?;
        response
            .text()
            .await
            .map_err(|err| CoreError::Upstream(format!("upstream body read failed: {err}")))
    }

    async fn complete_stream(
        &self,
        payload: &UpstreamPayload,
        credential: Option<&Credential>,
    ) -> Result<UpstreamEventStream, CoreError> {
        let permit = self.acquire_permit()?;
        let response = self.send(payload, credential).await?;
        debug!(event = "upstream.stream.opened", model = %payload.model);

        // The permit travels with the stream and is released when the caller drops it.
        let events = response.bytes_stream().eventsource().map(move |event| {
            let _held = &permit;
            event
                .map(|event| UpstreamEvent { data: event.data })
                .map_err(|err| CoreError::Upstream(format!("upstream stream failed: {err}")))
        });
        Ok(Box::pin(events))
    }
}

fn error_body_preview<E: fmt::Display>(body: Result<String, E>) -> String {
    match body {
        Ok(body) => body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect(),
        Err(err) => {
            debug!(event = "upstream.response.body_unreadable", error = %err);
            format!("<error body unreadable: {err}>")
        }
    }
}
