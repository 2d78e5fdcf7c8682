//! Remote forecast backend client
//!
//! HTTP client with per-attempt timeouts and exponential-backoff retries,
//! wrapped by a circuit breaker. Retriable failures are transport errors
//! and 408/429/5xx responses; other client errors still count against the
//! breaker but are returned immediately.

use crate::backend::{BackendHealth, DetectionRequest, ForecastBackend};
use async_trait::async_trait;
use pulse_common::config::ForecastConfig;
use pulse_common::time::now_millis;
use pulse_common::{
    AnomalyPoint, BackendCapabilities, CircuitBreaker, CircuitBreakerConfig, DetectionResult,
    Error, ForecastRequest, ForecastResult, ModelInfo, Prediction, Result, SeriesPoint,
    TimeSeries,
};
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Client for a remote forecast service
pub struct RemoteForecastClient {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    breaker: CircuitBreaker,
    max_retries: u32,
    retry_base_delay: Duration,
    request_timeout: Duration,
    health_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct RemoteSeriesPayload<'a> {
    tenant_id: &'a str,
    metric_key: &'a str,
    points: Vec<RemotePoint>,
}

#[derive(Debug, Serialize)]
struct RemotePoint {
    timestamp: String,
    value: f64,
}

#[derive(Debug, Serialize)]
struct RemoteForecastPayload<'a> {
    #[serde(flatten)]
    series: RemoteSeriesPayload<'a>,
    horizon: usize,
    confidence_levels: &'a [String],
}

#[derive(Debug, Serialize)]
struct RemoteDetectPayload<'a> {
    #[serde(flatten)]
    series: RemoteSeriesPayload<'a>,
    sensitivity: f64,
}

#[derive(Debug, Deserialize)]
struct RemoteForecastResponse {
    predictions: Vec<Prediction>,
    model_info: ModelInfo,
}

#[derive(Debug, Deserialize)]
struct RemoteDetectResponse {
    anomalies: Vec<AnomalyPoint>,
}

impl RemoteForecastClient {
    pub fn new(name: impl Into<String>, config: &ForecastConfig) -> Result<Self> {
        let base_url = config
            .remote_api_url
            .clone()
            .ok_or_else(|| Error::Configuration("remote forecast URL is not set".to_string()))?;
        let client = ClientBuilder::new()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(concat!("pulsewatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("failed to create HTTP client: {}", e)))?;
        let name = name.into();
        let breaker = CircuitBreaker::new(
            name.clone(),
            CircuitBreakerConfig {
                failure_threshold: config.breaker_failure_threshold,
                open_for: Duration::from_secs(config.breaker_open_for_secs),
            },
        );
        Ok(Self {
            name,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.remote_api_key.clone(),
            breaker,
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            health_timeout: Duration::from_millis(config.health_timeout_ms),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn series_payload<'a>(
        tenant_id: &'a str,
        metric_key: &'a str,
        series: &TimeSeries,
    ) -> RemoteSeriesPayload<'a> {
        RemoteSeriesPayload {
            tenant_id,
            metric_key,
            points: series
                .points
                .iter()
                .map(|p: &SeriesPoint| RemotePoint {
                    timestamp: pulse_common::time::format_timestamp(p.timestamp),
                    value: p.value,
                })
                .collect(),
        }
    }

    /// Run one POST with retries, each attempt gated by the breaker
    async fn post_with_resilience<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if !self.breaker.can_attempt().await {
                return Err(Error::UpstreamUnavailable(format!(
                    "circuit breaker '{}' is open",
                    self.name
                )));
            }

            match self.post_once(&url, body).await {
                Ok(parsed) => {
                    self.breaker.record_success().await;
                    return Ok(parsed);
                }
                Err(e) => {
                    self.breaker.record_failure().await;
                    let retryable = e.is_retryable();
                    warn!(
                        "remote call {} failed on attempt {}: {} (retryable: {})",
                        path,
                        attempt + 1,
                        e,
                        retryable
                    );
                    if !retryable {
                        return Err(e);
                    }
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        let delay = self.retry_base_delay * 2u32.saturating_pow(attempt);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Internal(format!("remote call {} exhausted retries", path))
        }))
    }

    async fn post_once<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T> {
        let mut request = self
            .client
            .post(url)
            .json(body)
            .timeout(self.request_timeout);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("request to {} timed out", url))
            } else {
                Error::Network(format!("request to {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::Network(format!("failed to parse response from {}: {}", url, e)))
    }
}

/// Map an HTTP error status to the taxonomy
fn classify_status(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::REQUEST_TIMEOUT => {
            Error::Timeout(format!("upstream returned 408: {}", body))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            Error::RateLimited(format!("upstream returned 429: {}", body))
        }
        status if status.is_server_error() => {
            Error::UpstreamUnavailable(format!("upstream returned {}: {}", status, body))
        }
        status => Error::Validation(format!("upstream rejected request ({}): {}", status, body)),
    }
}

#[async_trait]
impl ForecastBackend for RemoteForecastClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forecast(
        &self,
        request: &ForecastRequest,
        series: &TimeSeries,
    ) -> Result<ForecastResult> {
        let started = Instant::now();
        let payload = RemoteForecastPayload {
            series: Self::series_payload(&request.tenant_id, &request.metric_key, series),
            horizon: request.horizon,
            confidence_levels: &request.confidence_levels,
        };
        let response: RemoteForecastResponse =
            self.post_with_resilience("/v1/forecast", &payload).await?;
        debug!(
            "remote forecast for {} returned {} prediction(s)",
            request.metric_key,
            response.predictions.len()
        );
        Ok(ForecastResult {
            request_id: Uuid::new_v4(),
            tenant_id: request.tenant_id.clone(),
            metric_key: request.metric_key.clone(),
            dimensions: request.dimensions.clone(),
            backend: self.name.clone(),
            horizon: request.horizon,
            predictions: response.predictions,
            model_info: response.model_info,
            generated_at: now_millis(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn detect(
        &self,
        request: &DetectionRequest,
        series: &TimeSeries,
    ) -> Result<DetectionResult> {
        let started = Instant::now();
        let payload = RemoteDetectPayload {
            series: Self::series_payload(&request.tenant_id, &request.metric_key, series),
            sensitivity: request.sensitivity,
        };
        let response: RemoteDetectResponse =
            self.post_with_resilience("/v1/detect", &payload).await?;
        Ok(DetectionResult {
            request_id: Uuid::new_v4(),
            tenant_id: request.tenant_id.clone(),
            metric_key: request.metric_key.clone(),
            dimensions: request.dimensions.clone(),
            backend: self.name.clone(),
            anomalies: response.anomalies,
            detected_at: now_millis(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn check_health(&self) -> BackendHealth {
        let url = format!("{}/health", self.base_url);
        let mut request = self.client.get(&url).timeout(self.health_timeout);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => BackendHealth::healthy(),
            Ok(response) => {
                BackendHealth::unhealthy(format!("health probe returned {}", response.status()))
            }
            Err(e) => BackendHealth::unhealthy(format!("health probe failed: {}", e)),
        }
    }

    async fn capabilities(&self) -> BackendCapabilities {
        let url = format!("{}/v1/capabilities", self.base_url);
        let mut request = self.client.get(&url).timeout(self.health_timeout);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => response
                .json::<BackendCapabilities>()
                .await
                .unwrap_or_else(|_| conservative_capabilities()),
            _ => conservative_capabilities(),
        }
    }
}

/// Assumed capabilities when the probe is unavailable
fn conservative_capabilities() -> BackendCapabilities {
    BackendCapabilities {
        max_horizon: 24,
        supported_frequencies: vec!["1h".into()],
        supports_intervals: false,
        supports_batch: false,
        supports_exogenous: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_common::Dimensions;

    fn test_config(url: &str) -> ForecastConfig {
        ForecastConfig {
            remote_api_url: Some(url.to_string()),
            remote_api_key: Some("test-key".to_string()),
            request_timeout_ms: 200,
            health_timeout_ms: 100,
            max_retries: 1,
            retry_base_delay_ms: 1,
            breaker_failure_threshold: 2,
            breaker_open_for_secs: 60,
            ..ForecastConfig::default()
        }
    }

    fn tiny_series() -> TimeSeries {
        let base = pulse_common::time::parse_timestamp("2025-01-01T00:00:00.000Z").unwrap();
        let points = (0..5)
            .map(|i| SeriesPoint {
                timestamp: base + chrono::Duration::hours(i),
                value: i as f64,
            })
            .collect();
        TimeSeries::from_points("acme".into(), "system.cpu.usage".into(), Dimensions::new(), points)
    }

    #[test]
    fn status_classification_matches_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, ""),
            Error::Timeout(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            Error::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            Error::UpstreamUnavailable(_)
        ));
        let client_error = classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad payload");
        assert!(matches!(client_error, Error::Validation(_)));
        assert!(!client_error.is_retryable());
    }

    #[test]
    fn missing_url_is_a_configuration_error() {
        let config = ForecastConfig {
            remote_api_url: None,
            ..ForecastConfig::default()
        };
        assert!(RemoteForecastClient::new("remote", &config).is_err());
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_attempting() {
        let client =
            RemoteForecastClient::new("remote", &test_config("http://127.0.0.1:1")).unwrap();
        // Force the breaker open.
        client.breaker.record_failure().await;
        client.breaker.record_failure().await;

        let request = ForecastRequest {
            tenant_id: "acme".into(),
            metric_key: "system.cpu.usage".into(),
            dimensions: Dimensions::new(),
            horizon: 3,
            confidence_levels: vec!["0.95".into()],
        };
        let started = Instant::now();
        let err = client.forecast(&request, &tiny_series()).await.unwrap_err();
        match err {
            Error::UpstreamUnavailable(_) => {}
            other => panic!("expected upstream unavailable, got {:?}", other),
        }
        // No network attempt was made.
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn unreachable_upstream_surfaces_network_error_and_trips_breaker() {
        let client =
            RemoteForecastClient::new("remote", &test_config("http://127.0.0.1:1")).unwrap();
        let request = ForecastRequest {
            tenant_id: "acme".into(),
            metric_key: "system.cpu.usage".into(),
            dimensions: Dimensions::new(),
            horizon: 3,
            confidence_levels: vec!["0.95".into()],
        };
        let err = client.forecast(&request, &tiny_series()).await.unwrap_err();
        assert!(err.is_retryable());
        // Two attempts (1 retry) with threshold 2 leaves the breaker open.
        assert_eq!(
            client.breaker.state().await,
            pulse_common::CircuitState::Open
        );
    }
}
