//! Backend contract shared by all forecast and detection engines

use async_trait::async_trait;
use pulse_common::{
    BackendCapabilities, DetectionResult, Dimensions, Error, ForecastRequest, ForecastResult,
    Result, TimeSeries,
};

/// Request for an anomaly detection run over a stored series
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub tenant_id: String,
    pub metric_key: String,
    pub dimensions: Dimensions,
    /// 0.0 (least sensitive) to 1.0 (most sensitive); 0.5 is neutral
    pub sensitivity: f64,
    /// Attach surrounding points and local statistics to each anomaly
    pub include_context: bool,
}

impl DetectionRequest {
    pub fn new(tenant_id: impl Into<String>, metric_key: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            metric_key: metric_key.into(),
            dimensions: Dimensions::new(),
            sensitivity: 0.5,
            include_context: false,
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity = sensitivity.clamp(0.0, 1.0);
        self
    }

    pub fn with_context(mut self) -> Self {
        self.include_context = true;
        self
    }
}

/// Cached health verdict for one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHealth {
    pub healthy: bool,
    pub message: String,
}

impl BackendHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: "ok".to_string(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

/// Shared contract for forecast and detection backends.
///
/// Backends return failure responses through `Result`; only programmer
/// errors may panic. A backend that does not support one of the two
/// operations keeps the default body.
#[async_trait]
pub trait ForecastBackend: Send + Sync {
    /// Stable identifier used by the registry and persisted results
    fn name(&self) -> &str;

    async fn forecast(
        &self,
        _request: &ForecastRequest,
        _series: &TimeSeries,
    ) -> Result<ForecastResult> {
        Err(Error::Internal(format!(
            "backend '{}' does not support forecasting",
            self.name()
        )))
    }

    async fn detect(
        &self,
        _request: &DetectionRequest,
        _series: &TimeSeries,
    ) -> Result<DetectionResult> {
        Err(Error::Internal(format!(
            "backend '{}' does not support anomaly detection",
            self.name()
        )))
    }

    async fn check_health(&self) -> BackendHealth;

    async fn capabilities(&self) -> BackendCapabilities;
}

/// Built-in fallback used when no healthy backend is registered. Every
/// operation fails fast with a retryable error so callers surface the
/// outage instead of fabricating predictions.
pub struct NoopBackend;

#[async_trait]
impl ForecastBackend for NoopBackend {
    fn name(&self) -> &str {
        "noop"
    }

    async fn forecast(
        &self,
        _request: &ForecastRequest,
        _series: &TimeSeries,
    ) -> Result<ForecastResult> {
        Err(Error::UpstreamUnavailable(
            "no healthy forecast backend registered".to_string(),
        ))
    }

    async fn detect(
        &self,
        _request: &DetectionRequest,
        _series: &TimeSeries,
    ) -> Result<DetectionResult> {
        Err(Error::UpstreamUnavailable(
            "no healthy forecast backend registered".to_string(),
        ))
    }

    async fn check_health(&self) -> BackendHealth {
        BackendHealth::healthy()
    }

    async fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            max_horizon: 0,
            supported_frequencies: vec![],
            supports_intervals: false,
            supports_batch: false,
            supports_exogenous: false,
        }
    }
}
