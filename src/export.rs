//! Installation of the span export pipeline.

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{Sampler, SdkTracerProvider},
    Resource,
};
use tracing::warn;

use crate::error::Error;

/// Configuration forwarded to the exporter and sampler.
#[derive(Clone, Debug)]
pub struct ExportConfig {
    project_id: String,
    sampling_ratio: f64,
    endpoint: Option<String>,
}

impl ExportConfig {
    /// Export spans for the given project, sampling the given ratio of
    /// traces (`0.0` drops everything, `1.0` keeps everything).
    pub fn new(project_id: impl Into<String>, sampling_ratio: f64) -> Self {
        Self {
            project_id: project_id.into(),
            sampling_ratio,
            endpoint: None,
        }
    }

    /// Override the collector endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.project_id.trim().is_empty() {
            return Err(Error::InvalidProjectId(self.project_id.clone()));
        }
        if !(0.0..=1.0).contains(&self.sampling_ratio) {
            return Err(Error::InvalidSamplingRatio(self.sampling_ratio));
        }
        Ok(())
    }
}

/// Handle to the installed pipeline.
///
/// Spans buffered by the batch processor are lost unless [`shutdown`]
/// is called before the process exits.
///
/// [`shutdown`]: Telemetry::shutdown
#[derive(Debug)]
pub struct Telemetry {
    provider: SdkTracerProvider,
}

impl Telemetry {
    /// Flush buffered spans and shut the pipeline down.
    pub fn shutdown(self) {
        if let Err(err) = self.provider.shutdown() {
            warn!("failed to shut down the tracing pipeline: {err}");
        }
    }
}

/// Install the span export pipeline.
///
/// Builds the OTLP exporter, registers the tracer provider and the W3C
/// propagator globally, and returns the [`Telemetry`] handle. On error
/// nothing is registered and tracing stays disabled.
pub fn install(config: &ExportConfig) -> Result<Telemetry, Error> {
    config.validate()?;

    let mut builder = opentelemetry_otlp::SpanExporter::builder().with_tonic();
    if let Some(endpoint) = &config.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    let exporter = builder.build()?;

    let resource = Resource::builder()
        .with_attribute(KeyValue::new(
            "gcp.project_id",
            config.project_id.clone(),
        ))
        .build();

    // A sampled parent keeps the whole trace together, the ratio only
    // applies to root spans.
    let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
        config.sampling_ratio,
    )));

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(sampler)
        .with_resource(resource)
        .build();

    global::set_text_map_propagator(TraceContextPropagator::new());
    global::set_tracer_provider(provider.clone());

    Ok(Telemetry { provider })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_project_id_is_rejected() {
        let config = ExportConfig::new("  ", 1.0);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidProjectId(_))
        ));
    }

    #[test]
    fn out_of_range_sampling_ratio_is_rejected() {
        for ratio in [-0.1, 1.5, f64::NAN] {
            let config = ExportConfig::new("my-project", ratio);
            assert!(matches!(
                config.validate(),
                Err(Error::InvalidSamplingRatio(_))
            ));
        }
    }

    #[test]
    fn boundary_sampling_ratios_are_accepted() {
        for ratio in [0.0, 0.5, 1.0] {
            assert!(ExportConfig::new("my-project", ratio).validate().is_ok());
        }
    }
}
