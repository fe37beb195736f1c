use std::{env, time::Duration};

use opentelemetry_otlp::Protocol;

use crate::exporters::{TraceExporterKind, TraceSink, parse_http_protocol, parse_trace_sinks};

const DEFAULT_TRACE_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    None,
}

impl LogOutput {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Self::None,
            _ => Self::Stdout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_span_events: bool,
    pub log_output: LogOutput,
    pub trace_enabled: bool,
    pub trace_http_protocol: Protocol,
    pub trace_timeout: Duration,
    pub trace_sinks: Vec<TraceSink>,
    /// Problems found while reading the environment. Reported once the
    /// subscriber is installed.
    pub warnings: Vec<String>,
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut warnings = Vec::new();

        let trace_enabled = read("TB_TRACE_ENABLED").is_some_and(|v| is_truthy(&v));
        let trace_timeout = Duration::from_millis(
            read("TB_OTEL_TRACE_TIMEOUT_MS")
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(DEFAULT_TRACE_TIMEOUT_MS),
        );

        let mut trace_sinks = Vec::new();
        if trace_enabled {
            if let Some(spec) = read("TB_OTEL_TRACE_EXPORTERS") {
                let (sinks, invalid) = parse_trace_sinks(&spec);
                warnings.extend(invalid.into_iter().map(|reason| {
                    format!("ignoring TB_OTEL_TRACE_EXPORTERS entry ({reason})")
                }));
                trace_sinks = sinks;
            }
            if trace_sinks.is_empty() {
                let kind = TraceExporterKind::OtlpGrpc;
                trace_sinks.push(TraceSink { kind, endpoint: kind.default_endpoint().to_string() });
            }
        }

        Self {
            log_level: read("TB_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_span_events: read("TB_LOG_SPAN_EVENTS").is_some_and(|v| is_truthy(&v)),
            log_output: read("TB_LOG_EXPORTER").map_or(LogOutput::Stdout, |v| LogOutput::parse(&v)),
            trace_enabled,
            trace_http_protocol: read("TB_OTEL_TRACE_HTTP_PROTOCOL")
                .map_or(Protocol::HttpBinary, |v| parse_http_protocol(&v)),
            trace_timeout,
            trace_sinks,
            warnings,
        }
    }

    /// Fallback filter directives when `RUST_LOG` is unset.
    pub fn filter_directives(&self) -> String {
        let level = &self.log_level;
        format!(
            "{level},tagbridge_app={level},tagbridge_core={level},tagbridge_clients_upstream={level}"
        )
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
