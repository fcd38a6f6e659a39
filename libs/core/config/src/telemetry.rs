use crate::{env_or_default, env_parse, ConfigError, FromEnv};
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing::info;

/// OpenTelemetry tracer settings
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// Fraction of root traces to sample, 0.0..=1.0
    pub sample_ratio: f64,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            sample_ratio: 1.0,
        }
    }

    pub fn with_sample_ratio(mut self, ratio: f64) -> Self {
        self.sample_ratio = ratio.clamp(0.0, 1.0);
        self
    }
}

impl FromEnv for TelemetryConfig {
    /// Reads from environment variables with sensible defaults:
    /// - OTEL_SERVICE_NAME: defaults to "email-worker"
    /// - OTEL_TRACES_SAMPLER_ARG: defaults to 1.0 (sample everything)
    fn from_env() -> Result<Self, ConfigError> {
        let service_name = env_or_default("OTEL_SERVICE_NAME", "email-worker");
        let ratio: f64 = env_parse("OTEL_TRACES_SAMPLER_ARG", "1.0")?;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::ParseError {
                key: "OTEL_TRACES_SAMPLER_ARG".to_string(),
                details: format!("ratio {} is outside 0.0..=1.0", ratio),
            });
        }

        Ok(Self {
            service_name,
            sample_ratio: ratio,
        })
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::new("email-worker")
    }
}

/// Build the tracer provider for this process.
///
/// The provider carries a `service.name` resource and a parent-based ratio
/// sampler, so a sampled upstream trace is always continued. No exporter is
/// attached; callers that ship spans add one to the builder themselves.
pub fn init_tracer_provider(config: &TelemetryConfig) -> SdkTracerProvider {
    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();

    let provider = SdkTracerProvider::builder()
        .with_resource(resource)
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            config.sample_ratio,
        ))))
        .build();

    info!(
        service = %config.service_name,
        sample_ratio = config.sample_ratio,
        "Tracer provider initialized"
    );
    provider
}
