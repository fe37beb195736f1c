use futures::{Stream, StreamExt, stream};
use serde::Serialize;
use tagbridge_contracts::{ChatResponse, GenerateResponse, Message};

use crate::{CoreError, MessageStream};

pub fn chat_response(message: Message) -> ChatResponse {
    ChatResponse { message: Some(message), done: true }
}

pub fn chat_chunk(delta: Message) -> ChatResponse {
    ChatResponse { message: Some(delta), done: false }
}

pub fn chat_done() -> ChatResponse {
    ChatResponse { message: None, done: true }
}

pub fn generate_response(message: Message) -> GenerateResponse {
    GenerateResponse { response: Some(message.content), done: true }
}

pub fn generate_chunk(delta: Message) -> GenerateResponse {
    GenerateResponse { response: Some(delta.content), done: false }
}

pub fn generate_done() -> GenerateResponse {
    GenerateResponse { response: None, done: true }
}

/// Chat envelopes for a delta stream: one chunk per delta, then the done
/// record. A failed stream yields its error last and no done record.
pub fn chat_stream_envelope(
    deltas: MessageStream,
) -> impl Stream<Item = Result<ChatResponse, CoreError>> + Send {
    envelope_stream(deltas, chat_chunk, chat_done)
}

pub fn generate_stream_envelope(
    deltas: MessageStream,
) -> impl Stream<Item = Result<GenerateResponse, CoreError>> + Send {
    envelope_stream(deltas, generate_chunk, generate_done)
}

/// One NDJSON record, newline included.
pub fn to_ndjson_line<T: Serialize>(record: &T) -> Result<String, CoreError> {
    let mut line = serde_json::to_string(record)
        .map_err(|error| CoreError::Encode(format!("failed to encode stream record: {error}")))?;
    line.push('\n');
    Ok(line)
}

enum EnvelopeState {
    Open(MessageStream),
    Closed,
}

fn envelope_stream<T: Send + 'static>(
    deltas: MessageStream,
    chunk: fn(Message) -> T,
    done: fn() -> T,
) -> impl Stream<Item = Result<T, CoreError>> + Send {
    stream::unfold(EnvelopeState::Open(deltas), move |state| async move {
        let EnvelopeState::Open(mut deltas) = state else {
            return None;
        };
        match deltas.next().await {
            Some(Ok(delta)) => Some((Ok(chunk(delta)), EnvelopeState::Open(deltas))),
            Some(Err(error)) => Some((Err(error), EnvelopeState::Closed)),
            None => Some((Ok(done()), EnvelopeState::Closed)),
        }
    })
}
