use async_trait::async_trait;
use futures::stream;
use serde_json::json;
use tagbridge_contracts::{UpstreamPayload, UpstreamRole};
use tagbridge_core::{CoreError, Credential, UpstreamClient, UpstreamEvent, UpstreamEventStream};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Replies with the last user turn, one word per streamed fragment.
    Echo,
    /// Replies with these fragments in order.
    Fragments(Vec<String>),
    /// Streams these fragments, then breaks with an upstream error.
    Interrupted { fragments: Vec<String>, error: String },
    /// Fails every call with an upstream error.
    Fail(String),
}

/// Offline stand-in for the HTTP upstream. Serves canned assistant text in
/// the same wire shapes the real upstream uses and remembers what it saw.
pub struct ScriptedUpstreamClient {
    reply: ScriptedReply,
    last_payload: Mutex<Option<UpstreamPayload>>,
    last_credential: Mutex<Option<Credential>>,
}

impl ScriptedUpstreamClient {
    pub fn new(reply: ScriptedReply) -> Self {
        Self { reply, last_payload: Mutex::new(None), last_credential: Mutex::new(None) }
    }

    pub fn echo() -> Self {
        Self::new(ScriptedReply::Echo)
    }

    pub fn with_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ScriptedReply::Fragments(fragments.into_iter().map(Into::into).collect()))
    }

    pub async fn last_payload(&self) -> Option<UpstreamPayload> {
        self.last_payload.lock().await.clone()
    }

    /// Token of the last call, for assertions in tests.
    pub async fn last_token(&self) -> Option<String> {
        self.last_credential.lock().await.as_ref().map(|c| c.expose().to_string())
    }

    async fn record(
        &self,
        payload: &UpstreamPayload,
        credential: Option<&Credential>,
    ) -> Result<Vec<String>, CoreError> {
        *self.last_payload.lock().await = Some(payload.clone());
        *self.last_credential.lock().await = credential.map(|c| Credential::new(c.expose()));

        match &self.reply {
            ScriptedReply::Echo => Ok(echo_fragments(payload)),
            ScriptedReply::Fragments(fragments) | ScriptedReply::Interrupted { fragments, .. } => {
                Ok(fragments.clone())
            }
            ScriptedReply::Fail(message) => Err(CoreError::Upstream(message.clone())),
        }
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstreamClient {
    async fn complete(
        &self,
        payload: &UpstreamPayload,
        credential: Option<&Credential>,
    ) -> Result<String, CoreError> {
        let content = self.record(payload, credential).await?.concat();
        Ok(json!({"choices": [{"message": {"role": "assistant", "content": content}}]}).to_string())
    }

    async fn complete_stream(
        &self,
        payload: &UpstreamPayload,
        credential: Option<&Credential>,
    ) -> Result<UpstreamEventStream, CoreError> {
        let fragments = self.record(payload, credential).await?;
        let mut events = Vec::with_capacity(fragments.len() + 2);
        events.push(json!({"choices": [{"delta": {"role": "assistant", "content": ""}}]}));
        events.extend(
            fragments.into_iter().map(|content| json!({"choices": [{"delta": {"content": content}}]})),
        );
        let mut events = events
            .into_iter()
            .map(|data| Ok(UpstreamEvent { data: data.to_string() }))
            .collect::<Vec<_>>();
        match &self.reply {
            ScriptedReply::Interrupted { error, .. } => {
                events.push(Err(CoreError::Upstream(error.clone())));
            }
            _ => events.push(Ok(UpstreamEvent { data: "[DONE]".to_string() })),
        }
        Ok(Box::pin(stream::iter(events)))
    }
}

fn echo_fragments(payload: &UpstreamPayload) -> Vec<String> {
    let last_user = payload
        .messages
        .iter()
        .rev()
        .find(|message| message.role == UpstreamRole::User)
        .map(|message| message.content.as_str())
        .unwrap_or_default();
    last_user.split_inclusive(' ').map(str::to_string).collect()
}
