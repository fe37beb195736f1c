use std::time::Duration;

use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceExporterKind {
    OtlpGrpc,
    OtlpHttp,
}

impl TraceExporterKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "otlp_grpc" | "otlp-grpc" => Some(Self::OtlpGrpc),
            "otlp_http" | "otlp-http" => Some(Self::OtlpHttp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OtlpGrpc => "otlp_grpc",
            Self::OtlpHttp => "otlp_http",
        }
    }

    pub fn default_endpoint(self) -> &'static str {
        match self {
            Self::OtlpGrpc => "http://127.0.0.1:4317",
            Self::OtlpHttp => "http://127.0.0.1:4318/v1/traces",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSink {
    pub kind: TraceExporterKind,
    pub endpoint: String,
}

pub fn parse_http_protocol(raw: &str) -> Protocol {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Protocol::HttpJson,
        _ => Protocol::HttpBinary,
    }
}

/// Parses `kind=endpoint` pairs separated by commas. Returns the valid sinks
/// and one reason per rejected entry.
pub fn parse_trace_sinks(spec: &str) -> (Vec<TraceSink>, Vec<String>) {
    let mut sinks = Vec::new();
    let mut invalid = Vec::new();

    for entry in spec.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let Some((kind_raw, endpoint)) = entry.split_once('=') else {
            invalid.push(format!("missing '=' in '{entry}'"));
            continue;
        };
        let Some(kind) = TraceExporterKind::parse(kind_raw) else {
            invalid.push(format!("unknown exporter kind '{kind_raw}'"));
            continue;
        };
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            invalid.push(format!("empty endpoint for '{kind_raw}'"));
            continue;
        }
        sinks.push(TraceSink { kind, endpoint: endpoint.to_string() });
    }

    (sinks, invalid)
}

/// Builds one span exporter per sink. A sink that fails to build is reported
/// on stderr and skipped.
pub fn build_span_exporters(
    sinks: &[TraceSink],
    timeout: Duration,
    http_protocol: Protocol,
) -> Vec<SpanExporter> {
    sinks
        .iter()
        .filter_map(|sink| {
            let built = match sink.kind {
                TraceExporterKind::OtlpGrpc => SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(sink.endpoint.clone())
                    .with_timeout(timeout)
                    .build(),
                TraceExporterKind::OtlpHttp => SpanExporter::builder()
                    .with_http()
                    .with_endpoint(sink.endpoint.clone())
                    .with_timeout(timeout)
                    .with_protocol(http_protocol)
                    .build(),
            };
            built
                .map_err(|error| {
                    eprintln!(
                        "tagbridge: trace exporter {}={} unavailable: {error}; continuing without it",
                        sink.kind.as_str(),
                        sink.endpoint
                    );
                })
                .ok()
        })
        .collect()
}
