//! Ensemble anomaly detection
//!
//! Each point is scored by three detectors and the weighted blend is
//! compared against a sensitivity-adjusted threshold:
//!
//! - statistical: the stronger of a normalized z-score and the distance
//!   beyond the Tukey fences
//! - isolation: average and minimum distance from the trailing window,
//!   normalized by the data range
//! - local forecast: the residual of a one-step exponential-smoothing
//!   prediction from the trailing points, normalized by the local spread

use crate::backend::{BackendHealth, DetectionRequest, ForecastBackend};
use async_trait::async_trait;
use pulse_common::time::now_millis;
use pulse_common::{
    AnomalyContext, AnomalyPoint, AnomalySeverity, AnomalyType, BackendCapabilities,
    DetectionResult, Error, Result, TimeSeries,
};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

const MIN_POINTS: usize = 5;
const ISOLATION_WINDOW: usize = 10;
const LOCAL_FORECAST_WINDOW: usize = 5;
const Z_CLIP: f64 = 4.0;
const LOCAL_RESIDUAL_CLIP: f64 = 3.0;
const STD_FLOOR: f64 = 1e-9;

/// Ensemble weights and thresholds
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub statistical_weight: f64,
    pub isolation_weight: f64,
    pub local_forecast_weight: f64,
    pub base_threshold: f64,
    /// Points attached on each side when context is requested
    pub context_points: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            statistical_weight: 0.4,
            isolation_weight: 0.3,
            local_forecast_weight: 0.3,
            base_threshold: 0.7,
            context_points: 5,
        }
    }
}

impl DetectorConfig {
    /// Effective threshold after the sensitivity adjustment
    pub fn threshold_for(&self, sensitivity: f64) -> f64 {
        self.base_threshold - (sensitivity - 0.5) * 0.3
    }
}

/// Weighted ensemble of statistical, isolation and local-forecast scores
pub struct EnsembleDetector {
    config: DetectorConfig,
}

impl EnsembleDetector {
    pub fn new() -> Self {
        Self {
            config: DetectorConfig::default(),
        }
    }

    pub fn with_config(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Score every point and return those at or above the threshold
    pub fn detect_values(
        &self,
        values: &[f64],
        sensitivity: f64,
        include_context: bool,
    ) -> Result<Vec<ScoredAnomaly>> {
        if values.len() < MIN_POINTS {
            return Err(Error::InsufficientData(format!(
                "anomaly detection needs at least {} points, got {}",
                MIN_POINTS,
                values.len()
            )));
        }

        let stats = GlobalStats::from(values);
        let threshold = self.config.threshold_for(sensitivity);

        let scored: Vec<(f64, f64)> = (0..values.len())
            .map(|i| {
                let statistical = statistical_score(values[i], &stats);
                let isolation = isolation_score(values, i, &stats);
                let (local, expected) = local_forecast_score(values, i, &stats);
                let combined = self.config.statistical_weight * statistical
                    + self.config.isolation_weight * isolation
                    + self.config.local_forecast_weight * local;
                (combined, expected)
            })
            .collect();

        let combined: Vec<f64> = scored.iter().map(|(score, _)| *score).collect();

        let mut anomalies = Vec::new();
        for (index, (score, expected)) in scored.iter().enumerate() {
            if *score < threshold {
                continue;
            }
            let anomaly_type = classify(values, &combined, index, threshold, &stats);
            let context = if include_context {
                Some(build_context(values, index, self.config.context_points))
            } else {
                None
            };
            anomalies.push(ScoredAnomaly {
                index,
                observed: values[index],
                expected: *expected,
                score: *score,
                severity: AnomalySeverity::from_score(*score),
                anomaly_type,
                context,
            });
        }

        debug!(
            "ensemble scored {} point(s), {} above threshold {:.3}",
            values.len(),
            anomalies.len(),
            threshold
        );
        Ok(anomalies)
    }
}

impl Default for EnsembleDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// An anomaly scored against a plain value slice
#[derive(Debug, Clone)]
pub struct ScoredAnomaly {
    pub index: usize,
    pub observed: f64,
    pub expected: f64,
    pub score: f64,
    pub severity: AnomalySeverity,
    pub anomaly_type: AnomalyType,
    pub context: Option<AnomalyContext>,
}

#[async_trait]
impl ForecastBackend for EnsembleDetector {
    fn name(&self) -> &str {
        "ensemble"
    }

    async fn detect(
        &self,
        request: &DetectionRequest,
        series: &TimeSeries,
    ) -> Result<DetectionResult> {
        let started = Instant::now();
        let values = series.values();
        let scored = self.detect_values(&values, request.sensitivity, request.include_context)?;

        let anomalies = scored
            .into_iter()
            .map(|a| AnomalyPoint {
                anomaly_id: Uuid::new_v4(),
                timestamp: series.points[a.index].timestamp,
                index: a.index,
                observed: a.observed,
                expected: a.expected,
                score: a.score,
                severity: a.severity,
                anomaly_type: a.anomaly_type,
                description: format!(
                    "{} anomaly: observed {:.2}, expected {:.2} (score {:.3})",
                    a.anomaly_type.as_str(),
                    a.observed,
                    a.expected,
                    a.score
                ),
                context: a.context,
            })
            .collect();

        Ok(DetectionResult {
            request_id: Uuid::new_v4(),
            tenant_id: request.tenant_id.clone(),
            metric_key: request.metric_key.clone(),
            dimensions: request.dimensions.clone(),
            backend: self.name().to_string(),
            anomalies,
            detected_at: now_millis(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn check_health(&self) -> BackendHealth {
        BackendHealth::healthy()
    }

    async fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            max_horizon: 0,
            supported_frequencies: vec!["1m".into(), "5m".into(), "1h".into(), "1d".into()],
            supports_intervals: false,
            supports_batch: true,
            supports_exogenous: false,
        }
    }
}

struct GlobalStats {
    mean: f64,
    std: f64,
    range: f64,
    q1: f64,
    q3: f64,
}

impl GlobalStats {
    fn from(values: &[f64]) -> Self {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];
        Self {
            mean,
            std: variance.sqrt(),
            range: max - min,
            q1: quantile(&sorted, 0.25),
            q3: quantile(&sorted, 0.75),
        }
    }
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let position = q * (sorted.len() - 1) as f64;
    let low = position.floor() as usize;
    let high = position.ceil() as usize;
    if low == high {
        sorted[low]
    } else {
        let fraction = position - low as f64;
        sorted[low] * (1.0 - fraction) + sorted[high] * fraction
    }
}

/// Max of the normalized z-score and the Tukey-fence excess
fn statistical_score(value: f64, stats: &GlobalStats) -> f64 {
    let z = (value - stats.mean).abs() / stats.std.max(STD_FLOOR);
    let z_score = (z / Z_CLIP).min(1.0);

    let iqr = stats.q3 - stats.q1;
    let lower_fence = stats.q1 - 1.5 * iqr;
    let upper_fence = stats.q3 + 1.5 * iqr;
    let excess = if value < lower_fence {
        lower_fence - value
    } else if value > upper_fence {
        value - upper_fence
    } else {
        0.0
    };
    let iqr_score = (excess / (1.5 * iqr).max(STD_FLOOR)).min(1.0);

    z_score.max(iqr_score)
}

/// Distance of the point from its trailing window, normalized by the data
/// range. The first points have no window and score zero.
fn isolation_score(values: &[f64], index: usize, stats: &GlobalStats) -> f64 {
    let start = index.saturating_sub(ISOLATION_WINDOW);
    let window = &values[start..index];
    if window.len() < 2 || stats.range <= STD_FLOOR {
        return 0.0;
    }
    let value = values[index];
    let distances: Vec<f64> = window.iter().map(|w| (value - w).abs()).collect();
    let avg = distances.iter().sum::<f64>() / distances.len() as f64;
    let min = distances.iter().cloned().fold(f64::INFINITY, f64::min);
    let avg_norm = (avg / stats.range).min(1.0);
    let min_norm = (min / stats.range).min(1.0);
    ((avg_norm + min_norm) / 2.0).min(1.0)
}

/// Residual of a one-step exponential-smoothing prediction from the last
/// few points. Returns `(score, expected)`.
fn local_forecast_score(values: &[f64], index: usize, stats: &GlobalStats) -> (f64, f64) {
    let start = index.saturating_sub(LOCAL_FORECAST_WINDOW);
    let window = &values[start..index];
    if window.len() < 2 {
        return (0.0, stats.mean);
    }

    let mut smoothed = window[0];
    for value in &window[1..] {
        smoothed = 0.5 * value + 0.5 * smoothed;
    }
    let expected = smoothed;
    let residual = (values[index] - expected).abs();

    let window_mean = window.iter().sum::<f64>() / window.len() as f64;
    let local_std = (window.iter().map(|v| (v - window_mean).powi(2)).sum::<f64>()
        / window.len() as f64)
        .sqrt();
    let score = (residual / (LOCAL_RESIDUAL_CLIP * local_std.max(STD_FLOOR))).min(1.0);
    (score, expected)
}

/// Inspect the surrounding window to classify the anomaly shape
fn classify(
    values: &[f64],
    scores: &[f64],
    index: usize,
    threshold: f64,
    stats: &GlobalStats,
) -> AnomalyType {
    // Collective: three or more high-scoring neighbors within two points.
    let start = index.saturating_sub(2);
    let end = (index + 3).min(scores.len());
    let high_neighbors = (start..end)
        .filter(|i| *i != index && scores[*i] >= threshold)
        .count();
    if high_neighbors >= 3 {
        return AnomalyType::Collective;
    }

    // Level shift: the means of five points strictly before and three
    // strictly after differ by more than twice the prior spread. The
    // anomalous point itself is excluded so a lone spike does not qualify.
    if index >= 5 && index + 4 <= values.len() {
        let before = &values[index - 5..index];
        let after = &values[index + 1..index + 4];
        let before_mean = before.iter().sum::<f64>() / before.len() as f64;
        let after_mean = after.iter().sum::<f64>() / after.len() as f64;
        let before_var =
            before.iter().map(|v| (v - before_mean).powi(2)).sum::<f64>() / before.len() as f64;
        let before_std = before_var.sqrt().max(STD_FLOOR);
        if (after_mean - before_mean).abs() > 2.0 * before_std {
            return AnomalyType::LevelShift;
        }
    }

    // Trend change: the short-window slope flips sign around the point
    // with magnitude beyond the global spread.
    if index >= 5 && index + 6 <= values.len() {
        let before_slope = short_slope(&values[index - 5..index]);
        let after_slope = short_slope(&values[index + 1..index + 6]);
        let flipped = before_slope.signum() != after_slope.signum()
            && before_slope.abs() > STD_FLOOR
            && after_slope.abs() > STD_FLOOR;
        if flipped && (after_slope - before_slope).abs() > stats.std {
            return AnomalyType::TrendChange;
        }
    }

    AnomalyType::Point
}

fn short_slope(window: &[f64]) -> f64 {
    let n = window.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = window.iter().sum::<f64>() / n as f64;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, v) in window.iter().enumerate() {
        let dx = i as f64 - x_mean;
        numerator += dx * (v - y_mean);
        denominator += dx * dx;
    }
    if denominator <= STD_FLOOR {
        0.0
    } else {
        numerator / denominator
    }
}

fn build_context(values: &[f64], index: usize, context_points: usize) -> AnomalyContext {
    let start = index.saturating_sub(context_points);
    let end = (index + context_points + 1).min(values.len());
    let window_before = values[start..index].to_vec();
    let window_after = values[index + 1..end].to_vec();

    let local: Vec<f64> = values[start..end].to_vec();
    let local_mean = local.iter().sum::<f64>() / local.len() as f64;
    let local_std = (local.iter().map(|v| (v - local_mean).powi(2)).sum::<f64>()
        / local.len() as f64)
        .sqrt();

    AnomalyContext {
        window_before,
        window_after,
        local_mean,
        local_std,
    }
}
