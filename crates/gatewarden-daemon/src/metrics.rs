//! Prometheus metrics for the provider server.
//!
//! One histogram tracks request latency per endpoint and one counter tracks
//! request outcomes per endpoint and status code. The registry exports the
//! standard text exposition format for a localhost-only scrape endpoint.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors from metrics setup or export.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Registering a metric with Prometheus failed.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Encoding the exposition output failed.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),

    /// The configured backend name is not supported.
    #[error("unsupported metrics backend {0:?}")]
    UnknownBackend(String),
}

/// Supported metrics backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsBackend {
    /// Prometheus text exposition.
    Prometheus,
}

impl FromStr for MetricsBackend {
    type Err = MetricsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "prometheus" => Ok(Self::Prometheus),
            other => Err(MetricsError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for MetricsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prometheus => f.write_str("prometheus"),
        }
    }
}

/// Per-request metrics recorded by the server middleware.
pub struct RequestMetrics {
    request_duration_seconds: HistogramVec,
    requests_total: IntCounterVec,
}

impl RequestMetrics {
    fn register(registry: &Registry) -> Result<Self, MetricsError> {
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gatewarden_request_duration_seconds",
                "Provider request latency by endpoint",
            ),
            &["endpoint"],
        )?;
        let requests_total = IntCounterVec::new(
            Opts::new(
                "gatewarden_requests_total",
                "Provider requests by endpoint and status code",
            ),
            &["endpoint", "code"],
        )?;

        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        Ok(Self {
            request_duration_seconds,
            requests_total,
        })
    }

    /// Records one finished request.
    pub fn observe(&self, endpoint: &str, status: u16, seconds: f64) {
        self.request_duration_seconds
            .with_label_values(&[endpoint])
            .observe(seconds);
        self.requests_total
            .with_label_values(&[endpoint, &status.to_string()])
            .inc();
    }
}

/// Owns the Prometheus registry and the metric families recorded by the
/// server.
pub struct MetricsRegistry {
    registry: Registry,
    requests: Arc<RequestMetrics>,
}

impl MetricsRegistry {
    /// Creates a registry with all provider metrics registered.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::RegistrationFailed`] when a metric cannot be
    /// registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let requests = Arc::new(RequestMetrics::register(&registry)?);
        Ok(Self { registry, requests })
    }

    /// The request metrics handle for the server middleware.
    #[must_use]
    pub fn request_metrics(&self) -> Arc<RequestMetrics> {
        Arc::clone(&self.requests)
    }

    /// Encodes everything in Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::EncodingFailed`] when encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| MetricsError::EncodingFailed(error.to_string()))?;
        String::from_utf8(buffer).map_err(|error| MetricsError::EncodingFailed(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parses_known_names() {
        assert_eq!(
            "prometheus".parse::<MetricsBackend>().unwrap(),
            MetricsBackend::Prometheus
        );
        assert!(matches!(
            "statsd".parse::<MetricsBackend>(),
            Err(MetricsError::UnknownBackend(_))
        ));
    }

    #[test]
    fn observe_shows_up_in_exposition() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.request_metrics();
        metrics.observe("/ratify/gatekeeper/v1/verify", 200, 0.02);
        metrics.observe("/ratify/gatekeeper/v1/verify", 500, 1.5);

        let text = registry.encode_text().unwrap();
        assert!(text.contains("gatewarden_request_duration_seconds"));
        assert!(text.contains("gatewarden_requests_total"));
        assert!(text.contains("code=\"500\""));
    }

    #[test]
    fn empty_registry_still_encodes() {
        let registry = MetricsRegistry::new().unwrap();
        let text = registry.encode_text().unwrap();
        assert!(text.is_empty() || text.contains("gatewarden"));
    }
}
