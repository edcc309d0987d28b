//! Errors surfaced during pipeline installation.
//!
//! Only [`install`] is fallible; every runtime tracing path absorbs its
//! own failures so the HTTP transaction is never affected.
//!
//! [`install`]: crate::export::install

/// Error returned when the tracing pipeline cannot be installed.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The configured project identifier is empty or blank.
    #[error("invalid project id: {0:?}")]
    InvalidProjectId(String),

    /// The sampling ratio is outside the `[0.0, 1.0]` interval.
    #[error("sampling ratio {0} is outside [0.0, 1.0]")]
    InvalidSamplingRatio(f64),

    /// The span exporter could not be built.
    #[error(transparent)]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),
}
