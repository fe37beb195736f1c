pub mod config;
pub mod exporters;

use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing::warn;
use tracing_subscriber::{
    EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

pub use config::{LogOutput, ObservabilityConfig};

/// Keeps the tracer provider alive. Dropping it flushes pending spans.
#[derive(Default)]
pub struct ObservabilityGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(error) = provider.shutdown()
        {
            eprintln!("tagbridge: trace provider shutdown failed: {error}");
        }
    }
}

pub fn init_observability(service_name: &str) -> ObservabilityGuard {
    init_with_config(service_name, &ObservabilityConfig::from_env())
}

pub fn init_with_config(service_name: &str, config: &ObservabilityConfig) -> ObservabilityGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directives()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = (config.log_output == LogOutput::Stdout).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stdout)
            .with_span_events(if config.log_span_events {
                FmtSpan::NEW | FmtSpan::CLOSE
            } else {
                FmtSpan::NONE
            })
    });

    let tracer_provider = config.trace_enabled.then(|| build_tracer_provider(service_name, config));
    let telemetry_layer = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(telemetry_layer)
        .try_init()
        .ok();

    for warning in &config.warnings {
        warn!(event = "observability.config.warning", detail = %warning);
    }

    ObservabilityGuard { tracer_provider }
}

fn build_tracer_provider(service_name: &str, config: &ObservabilityConfig) -> SdkTracerProvider {
    let resource = Resource::builder().with_service_name(service_name.to_string()).build();
    let exporters = exporters::build_span_exporters(
        &config.trace_sinks,
        config.trace_timeout,
        config.trace_http_protocol,
    );
    exporters
        .into_iter()
        .fold(SdkTracerProvider::builder().with_resource(resource), |builder, exporter| {
            builder.with_batch_exporter(exporter)
        })
        .build()
}
