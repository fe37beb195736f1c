mod http;
mod scripted;

pub use http::{DEFAULT_UPSTREAM_BASE_URL, HttpUpstreamClient, UPSTREAM_CHAT_PATH};
pub use scripted::{ScriptedReply, ScriptedUpstreamClient};
