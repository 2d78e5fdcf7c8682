//! Forecast and anomaly data shapes shared across the pipeline

use crate::error::{Error, Result};
use crate::metric::Dimensions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Normalize a confidence-level key to the single accepted form:
/// decimal with a leading zero and exactly two decimals, e.g. `"0.80"`.
///
/// Alternatives like `"95"`, `".95"` or `"0.8"` are rejected rather than
/// silently coerced.
pub fn normalize_confidence_key(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let well_formed = bytes.len() == 4
        && bytes[0] == b'0'
        && bytes[1] == b'.'
        && bytes[2].is_ascii_digit()
        && bytes[3].is_ascii_digit();
    if !well_formed {
        return Err(Error::Validation(format!(
            "invalid confidence level '{}': expected form 0.NN",
            raw
        )));
    }
    let value: f64 = raw
        .parse()
        .map_err(|_| Error::Validation(format!("invalid confidence level '{}'", raw)))?;
    if value <= 0.0 || value >= 1.0 {
        return Err(Error::Validation(format!(
            "confidence level '{}' out of range (0, 1)",
            raw
        )));
    }
    Ok(raw.to_string())
}

/// Parse a normalized confidence key back into its numeric value
pub fn confidence_value(key: &str) -> Result<f64> {
    normalize_confidence_key(key)?;
    key.parse()
        .map_err(|_| Error::Validation(format!("invalid confidence level '{}'", key)))
}

/// Request for a forecast over a stored series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRequest {
    pub tenant_id: String,
    pub metric_key: String,
    #[serde(default)]
    pub dimensions: Dimensions,
    /// Number of steps to predict, in units of the series resolution
    pub horizon: usize,
    /// Confidence levels in the normalized `"0.NN"` key form
    #[serde(default = "default_confidence_levels")]
    pub confidence_levels: Vec<String>,
}

fn default_confidence_levels() -> Vec<String> {
    vec!["0.80".to_string(), "0.95".to_string()]
}

/// Prediction interval bounds for one confidence level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionInterval {
    pub lower: f64,
    pub upper: f64,
}

/// A single predicted point with widening intervals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Keyed by normalized confidence level, e.g. `"0.80"`
    pub intervals: BTreeMap<String, PredictionInterval>,
}

/// Training diagnostics emitted with a fitted model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub mape: f64,
    pub residual_std: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seasonal_period: Option<usize>,
    pub seasonal_strength: f64,
    pub trend: f64,
}

/// Identification and diagnostics of the model behind a forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    pub training_metrics: TrainingMetrics,
}

/// A completed forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub request_id: Uuid,
    pub tenant_id: String,
    pub metric_key: String,
    #[serde(default)]
    pub dimensions: Dimensions,
    pub backend: String,
    pub horizon: usize,
    pub predictions: Vec<Prediction>,
    pub model_info: ModelInfo,
    pub generated_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Severity bands for scored anomalies
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    /// Deterministic banding from an ensemble score
    pub fn from_score(score: f64) -> Self {
        if score >= 0.95 {
            AnomalySeverity::Critical
        } else if score >= 0.85 {
            AnomalySeverity::High
        } else if score >= 0.75 {
            AnomalySeverity::Medium
        } else {
            AnomalySeverity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalySeverity::Low => "low",
            AnomalySeverity::Medium => "medium",
            AnomalySeverity::High => "high",
            AnomalySeverity::Critical => "critical",
        }
    }
}

/// Shape classification for a detected anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Point,
    Collective,
    TrendChange,
    LevelShift,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::Point => "point",
            AnomalyType::Collective => "collective",
            AnomalyType::TrendChange => "trend_change",
            AnomalyType::LevelShift => "level_shift",
        }
    }
}

/// Local statistics around an anomaly, attached on request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyContext {
    pub window_before: Vec<f64>,
    pub window_after: Vec<f64>,
    pub local_mean: f64,
    pub local_std: f64,
}

/// A scored anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyPoint {
    pub anomaly_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Index into the analyzed series
    pub index: usize,
    pub observed: f64,
    pub expected: f64,
    pub score: f64,
    pub severity: AnomalySeverity,
    pub anomaly_type: AnomalyType,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<AnomalyContext>,
}

/// A completed detection run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub request_id: Uuid,
    pub tenant_id: String,
    pub metric_key: String,
    #[serde(default)]
    pub dimensions: Dimensions,
    pub backend: String,
    pub anomalies: Vec<AnomalyPoint>,
    pub detected_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Capabilities probe payload for a forecast backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub max_horizon: usize,
    pub supported_frequencies: Vec<String>,
    pub supports_intervals: bool,
    pub supports_batch: bool,
    pub supports_exogenous: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_keys_accept_only_normalized_form() {
        assert_eq!(normalize_confidence_key("0.80").unwrap(), "0.80");
        assert_eq!(normalize_confidence_key("0.95").unwrap(), "0.95");
        assert!(normalize_confidence_key("95").is_err());
        assert!(normalize_confidence_key("0.8").is_err());
        assert!(normalize_confidence_key(".95").is_err());
        assert!(normalize_confidence_key("0.950").is_err());
        assert!(normalize_confidence_key("1.00").is_err());
        assert!(normalize_confidence_key("0.00").is_err());
    }

    #[test]
    fn severity_bands_are_deterministic() {
        assert_eq!(AnomalySeverity::from_score(0.96), AnomalySeverity::Critical);
        assert_eq!(AnomalySeverity::from_score(0.95), AnomalySeverity::Critical);
        assert_eq!(AnomalySeverity::from_score(0.90), AnomalySeverity::High);
        assert_eq!(AnomalySeverity::from_score(0.80), AnomalySeverity::Medium);
        assert_eq!(AnomalySeverity::from_score(0.74), AnomalySeverity::Low);
    }

    #[test]
    fn severity_ordering_matches_escalation_order() {
        assert!(AnomalySeverity::Low < AnomalySeverity::Medium);
        assert!(AnomalySeverity::Medium < AnomalySeverity::High);
        assert!(AnomalySeverity::High < AnomalySeverity::Critical);
    }
}
