use futures::{StreamExt, stream};
use tagbridge_contracts::{Message, Role, UpstreamChunk, UpstreamCompletion, UpstreamReply};
use tracing::debug;

use crate::{CoreError, MessageStream, UpstreamEventStream};

pub const STREAM_DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    Delta(Message),
    Skip,
    Done,
}

/// Reads the assistant message out of a non-streaming completion body.
pub fn decode_completion(body: &str) -> Result<Message, CoreError> {
    let completion: UpstreamCompletion = serde_json::from_str(body)
        .map_err(|error| CoreError::Decode(format!("invalid completion body: {error}")))?;
    let Some(choice) = completion.choices.into_iter().next() else {
        return Err(CoreError::Decode("completion has no choices".to_string()));
    };
    Ok(reply_to_message(choice.message))
}

/// Interprets the data of one upstream stream event.
///
/// Keep-alives and chunks without a delta are skipped rather than treated as
/// errors. A chunk that is not valid JSON ends the stream with a decode error.
pub fn decode_event(data: &str) -> Result<DecodedEvent, CoreError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(DecodedEvent::Skip);
    }
    if data == STREAM_DONE_SENTINEL {
        return Ok(DecodedEvent::Done);
    }
    let chunk: UpstreamChunk = serde_json::from_str(data)
        .map_err(|error| CoreError::Decode(format!("invalid stream chunk: {error}")))?;
    let delta = chunk.choices.into_iter().next().and_then(|choice| choice.delta);
    Ok(delta.map_or(DecodedEvent::Skip, |reply| DecodedEvent::Delta(reply_to_message(reply))))
}

/// Turns raw upstream events into assistant deltas.
///
/// Ends after the first error or the done sentinel, whichever comes first.
pub fn decode_event_stream(events: UpstreamEventStream) -> MessageStream {
    let decoded = stream::unfold(Some(events), |events| async move {
        let mut events = events?;
        loop {
            let event = match events.next().await? {
                Ok(event) => event,
                Err(error) => return Some((Err(error), None)),
            };
            match decode_event(&event.data) {
                Ok(DecodedEvent::Delta(message)) => return Some((Ok(message), Some(events))),
                Ok(DecodedEvent::Skip) => continue,
                Ok(DecodedEvent::Done) => {
                    debug!(event = "upstream.stream.done_sentinel");
                    return None;
                }
                Err(error) => return Some((Err(error), None)),
            }
        }
    });
    Box::pin(decoded)
}

fn reply_to_message(reply: UpstreamReply) -> Message {
    Message::new(reply.role.map_or(Role::Assistant, Role::from), reply.content)
}

#[cfg(test)]
mod tests {
    use crate::UpstreamEvent;

    use super::*;

    fn events(data: &[&str]) -> UpstreamEventStream {
        let items = data
            .iter()
            .map(|data| Ok(UpstreamEvent { data: data.to_string() }))
            .collect::<Vec<_>>();
        Box::pin(stream::iter(items))
    }

    #[test]
    fn completion_body_yields_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Hello"}}]}"#;
        assert_eq!(decode_completion(body), Ok(Message::new(Role::Assistant, "Hello")));
    }

    #[test]
    fn completion_without_choices_is_a_decode_error() {
        assert!(matches!(decode_completion(r#"{"choices":[]}"#), Err(CoreError::Decode(_))));
        assert!(matches!(decode_completion("<html>busy</html>"), Err(CoreError::Decode(_))));
    }

    #[test]
    fn stream_event_kinds() {
        assert_eq!(decode_event(""), Ok(DecodedEvent::Skip));
        assert_eq!(decode_event("[DONE]"), Ok(DecodedEvent::Done));
        assert_eq!(decode_event(r#"{"choices":[]}"#), Ok(DecodedEvent::Skip));
        assert_eq!(decode_event(r#"{"choices":[{}]}"#), Ok(DecodedEvent::Skip));
        assert_eq!(
            decode_event(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#),
            Ok(DecodedEvent::Delta(Message::new(Role::Assistant, "Hi")))
        );
        assert!(matches!(decode_event("{not json"), Err(CoreError::Decode(_))));
    }

    #[tokio::test]
    async fn event_stream_stops_at_done_sentinel() {
        let decoded = decode_event_stream(events(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":"a"}}]}"#,
            "",
            r#"{"choices":[{"delta":{"content":"b"}}]}"#,
            "[DONE]",
            r#"{"choices":[{"delta":{"content":"late"}}]}"#,
        ]))
        .collect::<Vec<_>>()
        .await;
        assert_eq!(
            decoded,
            vec![Ok(Message::new(Role::Assistant, "a")), Ok(Message::new(Role::Assistant, "b"))]
        );
    }

    #[tokio::test]
    async fn event_stream_ends_after_bad_chunk() {
        let decoded = decode_event_stream(events(&[
            r#"{"choices":[{"delta":{"content":"a"}}]}"#,
            "oops",
            r#"{"choices":[{"delta":{"content":"b"}}]}"#,
        ]))
        .collect::<Vec<_>>()
        .await;
        assert_eq!(decoded.len(), 2);
        assert!(matches!(decoded[1], Err(CoreError::Decode(_))));
    }
}
