//! Recovery of tagged tool-call blocks from upstream assistant text.
//!
//! A block is the open marker, a newline, one line of JSON
//! `{"name": .., "arguments": ..}`, a newline and the close marker. Anything
//! else is left as plain text.

use std::{collections::VecDeque, mem};

use futures::{Stream, StreamExt, stream};
use tagbridge_contracts::{Message, Role, ToolCall, ToolCallFunction};
use tracing::{debug, warn};

use crate::{
    CoreError,
    prompt::{TOOL_CALL_CLOSE, TOOL_CALL_OPEN},
};

/// Parses every well-formed block in `content`, in source order.
///
/// Blocks whose line is not a valid call object are logged and skipped.
pub fn parse_tool_calls(content: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut cursor = 0;
    while let Some((candidate, next)) = next_block(content, cursor) {
        match serde_json::from_str::<ToolCallFunction>(candidate) {
            Ok(function) => calls.push(ToolCall { function }),
            Err(error) => warn!(
                event = "tool_call.parse_failed",
                candidate = %candidate,
                error = %error,
                "skipping malformed tool call block"
            ),
        }
        cursor = next;
    }
    calls
}

/// Non-streaming extraction: a message whose content holds at least one
/// parseable block comes back with empty content and `tool_calls` set.
/// Otherwise it is returned unchanged.
pub fn resolve_message(mut message: Message) -> Message {
    let calls = parse_tool_calls(&message.content);
    if !calls.is_empty() {
        message.content.clear();
        message.tool_calls = Some(calls);
    }
    message
}

// Returns the candidate line of the next block at or after `from`, plus the
// offset just past its close marker.
fn next_block(content: &str, from: usize) -> Option<(&str, usize)> {
    let mut search = from;
    loop {
        let open = search + content[search..].find(TOOL_CALL_OPEN)?;
        let after_open = open + TOOL_CALL_OPEN.len();
        let line_len = content[after_open..].strip_prefix('\n').and_then(|rest| rest.find('\n'));
        if let Some(line_len) = line_len {
            let line_start = after_open + 1;
            let line_end = line_start + line_len;
            if content[line_end + 1..].starts_with(TOOL_CALL_CLOSE) {
                let next = line_end + 1 + TOOL_CALL_CLOSE.len();
                return Some((&content[line_start..line_end], next));
            }
        }
        search = open + 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorState {
    Passthrough,
    Buffering,
}

/// Incremental counterpart of [`resolve_message`].
///
/// Deltas without an open marker pass straight through. From the open marker
/// on, text is held back until the close marker arrives, then the whole
/// block is emitted as a single delta. A fragment ending in a partial open
/// marker keeps that tail until the next fragment decides it.
#[derive(Debug)]
pub struct ToolCallExtractor {
    state: ExtractorState,
    buffer: String,
    carry: String,
    role: Role,
    produced_calls: bool,
}

impl Default for ToolCallExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallExtractor {
    pub fn new() -> Self {
        Self {
            state: ExtractorState::Passthrough,
            buffer: String::new(),
            carry: String::new(),
            role: Role::Assistant,
            produced_calls: false,
        }
    }

    pub fn state(&self) -> ExtractorState {
        self.state
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Tail of the last fragment that may still become an open marker.
    pub fn held_back(&self) -> &str {
        &self.carry
    }

    /// Feeds one upstream delta and returns the deltas ready for the caller,
    /// in order. Most calls yield zero or one delta.
    pub fn push(&mut self, delta: Message) -> Vec<Message> {
        self.role = delta.role;
        if self.state == ExtractorState::Passthrough
            && self.carry.is_empty()
            && !delta.content.contains(TOOL_CALL_OPEN)
            && partial_open_len(&delta.content) == 0
        {
            return vec![delta];
        }

        let mut emitted = Vec::new();
        let mut pending = mem::take(&mut self.carry);
        pending.push_str(&delta.content);
        loop {
            match self.state {
                ExtractorState::Passthrough => {
                    let Some(at) = pending.find(TOOL_CALL_OPEN) else {
                        let held = partial_open_len(&pending);
                        self.carry = pending.split_off(pending.len() - held);
                        if !pending.is_empty() {
                            emitted.push(Message::new(self.role, pending));
                        }
                        break;
                    };
                    let block = pending.split_off(at);
                    if !pending.is_empty() {
                        emitted.push(Message::new(self.role, pending));
                    }
                    pending = block;
                    self.state = ExtractorState::Buffering;
                }
                ExtractorState::Buffering => {
                    let resume = close_search_start(&self.buffer);
                    self.buffer.push_str(&pending);
                    let Some(offset) = self.buffer[resume..].find(TOOL_CALL_CLOSE) else {
                        break;
                    };
                    pending = self.buffer.split_off(resume + offset + TOOL_CALL_CLOSE.len());
                    let block = mem::take(&mut self.buffer);
                    self.state = ExtractorState::Passthrough;
                    emitted.extend(self.close_block(block));
                    if pending.is_empty() {
                        break;
                    }
                }
            }
        }
        emitted
    }

    /// Called once the upstream sequence has ended. An unterminated block or
    /// a held-back marker prefix is handed back as plain text.
    pub fn finish(&mut self) -> Option<Message> {
        self.state = ExtractorState::Passthrough;
        if !self.carry.is_empty() {
            return Some(Message::new(self.role, mem::take(&mut self.carry)));
        }
        if self.buffer.is_empty() {
            return None;
        }
        let text = mem::take(&mut self.buffer);
        warn!(
            event = "tool_call.block_truncated",
            buffered_bytes = text.len(),
            "stream ended inside a tool call block; flushing it as text"
        );
        Some(Message::new(self.role, text))
    }

    /// Drops any partially buffered block.
    pub fn discard(&mut self) {
        self.state = ExtractorState::Passthrough;
        self.buffer.clear();
        self.carry.clear();
    }

    // A malformed block after the first parsed call is dropped, the same way
    // whole-text extraction clears it from the content.
    fn close_block(&mut self, block: String) -> Option<Message> {
        let calls = parse_tool_calls(&block);
        debug!(event = "tool_call.block_closed", calls = calls.len(), block_bytes = block.len());
        if calls.is_empty() {
            return (!self.produced_calls).then(|| Message::new(self.role, block));
        }
        self.produced_calls = true;
        Some(Message { role: self.role, content: String::new(), images: None, tool_calls: Some(calls) })
    }
}

// Length of the longest proper prefix of the open marker that ends `text`.
fn partial_open_len(text: &str) -> usize {
    (1..TOOL_CALL_OPEN.len())
        .rev()
        .find(|&len| text.ends_with(&TOOL_CALL_OPEN[..len]))
        .unwrap_or(0)
}

// The close marker may straddle the previous fragment boundary.
fn close_search_start(buffer: &str) -> usize {
    let mut start = buffer.len().saturating_sub(TOOL_CALL_CLOSE.len() - 1);
    while !buffer.is_char_boundary(start) {
        start -= 1;
    }
    start
}

struct Extraction<S> {
    upstream: S,
    extractor: ToolCallExtractor,
    ready: VecDeque<Message>,
    finished: bool,
}

/// Runs [`ToolCallExtractor`] over a live delta stream.
///
/// The upstream is only polled when the caller asks for the next item and
/// nothing is ready, so dropping the returned stream stops the upstream read.
/// An upstream error is forwarded once and ends the sequence; any partially
/// buffered block is discarded with it.
pub fn extract_stream<S>(upstream: S) -> impl Stream<Item = Result<Message, CoreError>> + Send
where
    S: Stream<Item = Result<Message, CoreError>> + Send + Unpin,
{
    let state = Extraction {
        upstream,
        extractor: ToolCallExtractor::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(message) = state.ready.pop_front() {
                return Some((Ok(message), state));
            }
            if state.finished {
                return None;
            }
            match state.upstream.next().await {
                Some(Ok(delta)) => state.ready.extend(state.extractor.push(delta)),
                Some(Err(error)) => {
                    state.finished = true;
                    state.extractor.discard();
                    return Some((Err(error), state));
                }
                None => {
                    state.finished = true;
                    state.ready.extend(state.extractor.finish());
                }
            }
        }
    })
}
