use tagbridge_contracts::Tool;
use tracing::warn;

pub const TOOLS_OPEN: &str = "<tools>";
pub const TOOLS_CLOSE: &str = "</tools>";
pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";
pub const TOOL_RESPONSE_OPEN: &str = "<tool_response>";
pub const TOOL_RESPONSE_CLOSE: &str = "</tool_response>";

/// Renders the system-prompt section that teaches the upstream model the
/// tagged tool-call convention.
///
/// Each declaration is written as one line of compact JSON. The markers are
/// the same constants the extractor scans for.
pub fn render_tools_prompt(tools: &[Tool]) -> String {
    let declarations = tools
        .iter()
        .filter_map(|tool| match serde_json::to_string(tool) {
            Ok(line) => Some(line),
            Err(error) => {
                warn!(
                    event = "tools_prompt.declaration_skipped",
                    tool = %tool.function.name,
                    error = %error
                );
                None
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut prompt = String::with_capacity(declarations.len() + 512);
    prompt.push_str("\n# Tools\n\n");
    prompt.push_str("You may call one or more functions to assist with the user query.\n\n");
    prompt.push_str(&format!(
        "You are provided with function signatures within {TOOLS_OPEN}{TOOLS_CLOSE} XML tags:\n"
    ));
    prompt.push_str(&format!("{TOOLS_OPEN}\n{declarations}\n{TOOLS_CLOSE}\n\n"));
    prompt.push_str(&format!(
        "For each function call, return a json object with function name and arguments within {TOOL_CALL_OPEN}{TOOL_CALL_CLOSE} XML tags:\n"
    ));
    prompt.push_str(&format!(
        "{TOOL_CALL_OPEN}\n{{\"name\": <function-name>, \"arguments\": <args-json-object>}}\n{TOOL_CALL_CLOSE}\n"
    ));
    prompt
}
