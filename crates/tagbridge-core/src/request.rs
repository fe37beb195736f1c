use tagbridge_contracts::{
    ChatRequest, Message, Role, ToolCall, UpstreamMessage, UpstreamPayload, UpstreamRole,
};
use tracing::{debug, warn};

use crate::prompt::{
    TOOL_CALL_CLOSE, TOOL_CALL_OPEN, TOOL_RESPONSE_CLOSE, TOOL_RESPONSE_OPEN, render_tools_prompt,
};

pub const UPSTREAM_CHAT_ID: &str = "local";
pub const UPSTREAM_INCREMENTAL_OUTPUT: bool = true;

/// Maps a caller chat request onto the upstream payload.
///
/// Tool results are rewritten as user turns first, so prompt injection only
/// ever sees the three roles the upstream understands.
pub fn translate_request(request: ChatRequest) -> UpstreamPayload {
    let stream = request.wants_stream();
    let images = request.messages.iter().filter(|m| m.images.is_some()).count();
    if images > 0 || request.options.is_some() || request.format.is_some() {
        debug!(
            event = "request.fields_not_forwarded",
            model = %request.model,
            messages_with_images = images,
            has_options = request.options.is_some(),
            has_format = request.format.is_some()
        );
    }

    let mut messages = request.messages.into_iter().map(to_upstream_message).collect::<Vec<_>>();
    if let Some(tools) = request.tools.as_deref().filter(|tools| !tools.is_empty()) {
        inject_tools_prompt(&mut messages, &render_tools_prompt(tools));
    }

    UpstreamPayload {
        model: request.model,
        messages,
        stream,
        chat_id: UPSTREAM_CHAT_ID.to_string(),
        incremental_output: UPSTREAM_INCREMENTAL_OUTPUT,
    }
}

pub fn wrap_tool_response(content: &str) -> String {
    format!("{TOOL_RESPONSE_OPEN}{content}{TOOL_RESPONSE_CLOSE}")
}

fn to_upstream_message(message: Message) -> UpstreamMessage {
    match message.role {
        Role::Tool => {
            UpstreamMessage { role: UpstreamRole::User, content: wrap_tool_response(&message.content) }
        }
        Role::System => UpstreamMessage { role: UpstreamRole::System, content: message.content },
        Role::User => UpstreamMessage { role: UpstreamRole::User, content: message.content },
        Role::Assistant => {
            let content = replay_tool_calls(message.content, message.tool_calls.as_deref());
            UpstreamMessage { role: UpstreamRole::Assistant, content }
        }
    }
}

// Earlier assistant calls go back upstream in the same tagged form the model produced.
fn replay_tool_calls(content: String, tool_calls: Option<&[ToolCall]>) -> String {
    let Some(calls) = tool_calls.filter(|calls| !calls.is_empty()) else {
        return content;
    };
    let mut blocks = Vec::with_capacity(calls.len() + 1);
    if !content.is_empty() {
        blocks.push(content);
    }
    for call in calls {
        let line = serde_json::json!({
            "name": call.function.name,
            "arguments": call.function.arguments,
        });
        match serde_json::to_string(&line) {
            Ok(line) => blocks.push(format!("{TOOL_CALL_OPEN}\n{line}\n{TOOL_CALL_CLOSE}")),
            Err(error) => warn!(
                event = "request.tool_call_replay_skipped",
                tool = %call.function.name,
                error = %error
            ),
        }
    }
    blocks.join("\n")
}

fn inject_tools_prompt(messages: &mut Vec<UpstreamMessage>, prompt: &str) {
    match messages.first_mut() {
        Some(first) if first.role == UpstreamRole::System => first.content.push_str(prompt),
        _ => messages
            .insert(0, UpstreamMessage { role: UpstreamRole::System, content: prompt.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tagbridge_contracts::{Tool, ToolCallFunction};

    use super::*;

    fn tool() -> Tool {
        serde_json::from_value(json!({
            "type": "function",
            "function": {
                "name": "lookup",
                "description": "Look up a city",
                "parameters": {
                    "type": "object",
                    "properties": {"city": {"type": "string", "description": "City name"}}
                }
            }
        }))
        .expect("tool must deserialize")
    }

    fn request(messages: Vec<Message>, tools: Option<Vec<Tool>>) -> ChatRequest {
        ChatRequest {
            model: "qwen-max-latest".to_string(),
            messages,
            stream: Some(false),
            format: None,
            keep_alive: None,
            tools,
            options: None,
        }
    }

    #[test]
    fn tool_role_becomes_wrapped_user_turn() {
        let payload = translate_request(request(
            vec![Message::new(Role::User, "weather?"), Message::new(Role::Tool, r#"{"temp":21}"#)],
            None,
        ));
        assert_eq!(payload.messages[1].role, UpstreamRole::User);
        assert_eq!(payload.messages[1].content, r#"<tool_response>{"temp":21}</tool_response>"#);
    }

    #[test]
    fn tools_prompt_appends_to_existing_system_message() {
        let payload = translate_request(request(
            vec![Message::new(Role::System, "be terse"), Message::new(Role::User, "hi")],
            Some(vec![tool()]),
        ));
        assert_eq!(payload.messages.len(), 2);
        assert_eq!(payload.messages[0].content, format!("be terse{}", render_tools_prompt(&[tool()])));
        assert_eq!(payload.messages[1].content, "hi");
    }

    #[test]
    fn tools_prompt_prepends_single_system_message_otherwise() {
        let original = vec![Message::new(Role::User, "hi"), Message::new(Role::Assistant, "hello")];
        let payload = translate_request(request(original, Some(vec![tool()])));
        assert_eq!(payload.messages.len(), 3);
        assert_eq!(payload.messages[0].role, UpstreamRole::System);
        assert_eq!(payload.messages[0].content, render_tools_prompt(&[tool()]));
        assert_eq!(payload.messages[1], UpstreamMessage { role: UpstreamRole::User, content: "hi".to_string() });
        assert_eq!(
            payload.messages[2],
            UpstreamMessage { role: UpstreamRole::Assistant, content: "hello".to_string() }
        );
    }

    #[test]
    fn leading_tool_message_is_remapped_before_injection() {
        let payload = translate_request(request(vec![Message::new(Role::Tool, "42")], Some(vec![tool()])));
        assert_eq!(payload.messages.len(), 2);
        assert_eq!(payload.messages[0].role, UpstreamRole::System);
        assert_eq!(payload.messages[1].content, "<tool_response>42</tool_response>");
    }

    #[test]
    fn empty_tool_list_leaves_messages_untouched() {
        let payload = translate_request(request(vec![Message::new(Role::User, "hi")], Some(vec![])));
        assert_eq!(payload.messages.len(), 1);
        assert_eq!(payload.messages[0].role, UpstreamRole::User);
    }

    #[test]
    fn upstream_constants_and_flags_pass_through() {
        let mut chat = request(vec![Message::new(Role::User, "hi")], None);
        chat.stream = None;
        let payload = translate_request(chat);
        assert_eq!(payload.model, "qwen-max-latest");
        assert!(payload.stream);
        assert_eq!(payload.chat_id, "local");
        assert!(payload.incremental_output);
        assert_eq!(
            serde_json::to_value(&payload).expect("payload must serialize"),
            json!({
                "model": "qwen-max-latest",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
                "chat_id": "local",
                "incremental_output": true
            })
        );
    }

    #[test]
    fn assistant_tool_calls_are_replayed_as_tagged_blocks() {
        let mut arguments = serde_json::Map::new();
        arguments.insert("city".to_string(), json!("Oslo"));
        let assistant = Message {
            role: Role::Assistant,
            content: String::new(),
            images: None,
            tool_calls: Some(vec![ToolCall {
                function: ToolCallFunction { name: "lookup".to_string(), arguments },
            }]),
        };
        let payload = translate_request(request(vec![assistant], None));
        assert_eq!(
            payload.messages[0].content,
            "<tool_call>\n{\"name\":\"lookup\",\"arguments\":{\"city\":\"Oslo\"}}\n</tool_call>"
        );
    }
}
