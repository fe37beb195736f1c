use std::env;

use secrecy::SecretString;
use tagbridge_clients_upstream::DEFAULT_UPSTREAM_BASE_URL;

pub const DEFAULT_PORT: u16 = 11434;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECONDS: u64 = 120;
pub const DEFAULT_UPSTREAM_MAX_INFLIGHT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMode {
    Http,
    Scripted,
}

#[derive(Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub upstream_mode: UpstreamMode,
    pub upstream_base_url: String,
    pub upstream_token: Option<SecretString>,
    pub upstream_timeout_seconds: u64,
    pub upstream_max_inflight: usize,
    pub supported_models: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid TB_PORT value: {0}")]
    InvalidPort(String),
    #[error("invalid TB_UPSTREAM_TIMEOUT value: {0}")]
    InvalidUpstreamTimeout(String),
    #[error("invalid TB_UPSTREAM_MAX_INFLIGHT value: {0}")]
    InvalidUpstreamMaxInflight(String),
    #[error("invalid TB_UPSTREAM_MODE value: {0}")]
    InvalidUpstreamMode(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = read("TB_HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let port = match read("TB_PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::InvalidPort(raw))?,
            None => DEFAULT_PORT,
        };

        let upstream_mode = match read("TB_UPSTREAM_MODE") {
            Some(raw) => parse_upstream_mode(&raw).ok_or(ConfigError::InvalidUpstreamMode(raw))?,
            None => UpstreamMode::Http,
        };

        let upstream_timeout_seconds = match read("TB_UPSTREAM_TIMEOUT") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|seconds| *seconds > 0)
                .ok_or(ConfigError::InvalidUpstreamTimeout(raw))?,
            None => DEFAULT_UPSTREAM_TIMEOUT_SECONDS,
        };

        let upstream_max_inflight = match read("TB_UPSTREAM_MAX_INFLIGHT") {
            Some(raw) => {
                parse_positive_usize(&raw).ok_or(ConfigError::InvalidUpstreamMaxInflight(raw))?
            }
            None => DEFAULT_UPSTREAM_MAX_INFLIGHT,
        };

        let upstream_token =
            read("TB_UPSTREAM_TOKEN").or_else(|| read("QWEN_TOKEN")).map(SecretString::from);

        Ok(Self {
            host,
            port,
            upstream_mode,
            upstream_base_url: read("TB_UPSTREAM_BASE_URL")
                .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string()),
            upstream_token,
            upstream_timeout_seconds,
            upstream_max_inflight,
            supported_models: read("TB_SUPPORTED_MODELS")
                .map(|raw| parse_string_list(&raw))
                .unwrap_or_default(),
        })
    }

    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            upstream_mode: UpstreamMode::Scripted,
            upstream_base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            upstream_token: None,
            upstream_timeout_seconds: 5,
            upstream_max_inflight: 4,
            supported_models: vec!["qwen-max-latest".to_string(), "qwen-plus".to_string()],
        }
    }
}

fn parse_upstream_mode(value: &str) -> Option<UpstreamMode> {
    match value.to_ascii_lowercase().as_str() {
        "http" => Some(UpstreamMode::Http),
        "scripted" => Some(UpstreamMode::Scripted),
        _ => None,
    }
}

fn parse_positive_usize(value: &str) -> Option<usize> {
    let parsed = value.trim().parse::<usize>().ok()?;
    if parsed == 0 { None } else { Some(parsed) }
}

/// Accepts a JSON array of strings or a comma separated list.
fn parse_string_list(raw: &str) -> Vec<String> {
    let items = if raw.starts_with('[') {
        serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
    } else {
        raw.split(',').map(str::to_string).collect()
    };
    items.into_iter().map(|item| item.trim().to_string()).filter(|item| !item.is_empty()).collect()
}
