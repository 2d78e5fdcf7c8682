//! Forecast and anomaly evaluation, walk-forward backtesting, and
//! synthetic benchmark generators

use pulse_common::{confidence_value, Error, Prediction, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::debug;

/// Forecast accuracy metrics. Coverage fields are present only when the
/// evaluated predictions carry intervals for the matching level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForecastAccuracy {
    pub mae: f64,
    pub mse: f64,
    pub rmse: f64,
    /// Percent, computed over the non-zero actuals
    pub mape: f64,
    pub smape: f64,
    pub r2: f64,
    pub coverage_80: Option<f64>,
    pub coverage_95: Option<f64>,
    pub pairs: usize,
}

/// Evaluate predictions against observed values, pairing by timestamp only
pub fn evaluate_forecast(
    actuals: &[(DateTime<Utc>, f64)],
    predictions: &[Prediction],
) -> Result<ForecastAccuracy> {
    let observed: HashMap<i64, f64> = actuals
        .iter()
        .map(|(ts, v)| (ts.timestamp_millis(), *v))
        .collect();

    let mut pairs: Vec<(f64, &Prediction)> = Vec::new();
    for prediction in predictions {
        if let Some(actual) = observed.get(&prediction.timestamp.timestamp_millis()) {
            pairs.push((*actual, prediction));
        }
    }
    if pairs.is_empty() {
        return Err(Error::InsufficientData(
            "no prediction timestamps matched observed values".to_string(),
        ));
    }

    let actual_values: Vec<f64> = pairs.iter().map(|(a, _)| *a).collect();
    let predicted_values: Vec<f64> = pairs.iter().map(|(_, p)| p.value).collect();
    let mut accuracy = point_accuracy(&actual_values, &predicted_values);

    accuracy.coverage_80 = interval_coverage(&pairs, "0.80");
    accuracy.coverage_95 = interval_coverage(&pairs, "0.95");
    Ok(accuracy)
}

/// Point-estimate metrics for paired actual/predicted slices
pub fn point_accuracy(actuals: &[f64], predictions: &[f64]) -> ForecastAccuracy {
    let n = actuals.len().min(predictions.len());
    let actuals = &actuals[..n];
    let predictions = &predictions[..n];

    let mut abs_sum = 0.0;
    let mut sq_sum = 0.0;
    let mut mape_sum = 0.0;
    let mut mape_count = 0usize;
    let mut smape_sum = 0.0;
    for (a, p) in actuals.iter().zip(predictions) {
        let error = a - p;
        abs_sum += error.abs();
        sq_sum += error * error;
        if a.abs() > f64::EPSILON {
            mape_sum += (error / a).abs();
            mape_count += 1;
        }
        let denom = (a.abs() + p.abs()) / 2.0;
        if denom > f64::EPSILON {
            smape_sum += (error.abs() / denom) * 100.0;
        }
    }

    let mae = abs_sum / n as f64;
    let mse = sq_sum / n as f64;
    let actual_mean = actuals.iter().sum::<f64>() / n as f64;
    let ss_tot: f64 = actuals.iter().map(|a| (a - actual_mean).powi(2)).sum();
    let r2 = if ss_tot > f64::EPSILON {
        1.0 - sq_sum / ss_tot
    } else if mse <= f64::EPSILON {
        1.0
    } else {
        0.0
    };

    ForecastAccuracy {
        mae,
        mse,
        rmse: mse.sqrt(),
        mape: if mape_count == 0 {
            0.0
        } else {
            100.0 * mape_sum / mape_count as f64
        },
        smape: smape_sum / n as f64,
        r2,
        coverage_80: None,
        coverage_95: None,
        pairs: n,
    }
}

fn interval_coverage(pairs: &[(f64, &Prediction)], level: &str) -> Option<f64> {
    // The level key is already in normalized form here.
    confidence_value(level).ok()?;
    let mut covered = 0usize;
    let mut counted = 0usize;
    for (actual, prediction) in pairs {
        if let Some(interval) = prediction.intervals.get(level) {
            counted += 1;
            if *actual >= interval.lower && *actual <= interval.upper {
                covered += 1;
            }
        }
    }
    if counted == 0 {
        None
    } else {
        Some(covered as f64 / counted as f64)
    }
}

/// Anomaly detection accuracy with index-tolerance matching
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnomalyAccuracy {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

/// Score detected anomaly indices against labeled ones. A detection within
/// `tolerance` points of a label counts as a hit; each label matches at
/// most once.
pub fn evaluate_anomalies(
    detected: &[usize],
    labeled: &[usize],
    series_len: usize,
    tolerance: usize,
) -> AnomalyAccuracy {
    let mut matched_labels = vec![false; labeled.len()];
    let mut true_positives = 0usize;
    let mut false_positives = 0usize;

    for &index in detected {
        let hit = labeled.iter().enumerate().find(|(li, &label)| {
            !matched_labels[*li] && index.abs_diff(label) <= tolerance
        });
        match hit {
            Some((li, _)) => {
                matched_labels[li] = true;
                true_positives += 1;
            }
            None => false_positives += 1,
        }
    }
    let false_negatives = matched_labels.iter().filter(|m| !**m).count();

    let precision = ratio(true_positives, true_positives + false_positives);
    let recall = ratio(true_positives, true_positives + false_negatives);
    let f1 = if precision + recall > f64::EPSILON {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };
    let true_negatives = series_len
        .saturating_sub(true_positives + false_positives + false_negatives);
    let accuracy = ratio(true_positives + true_negatives, series_len);

    AnomalyAccuracy {
        precision,
        recall,
        f1,
        accuracy,
        true_positives,
        false_positives,
        false_negatives,
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Walk-forward backtest configuration
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub folds: usize,
    pub horizon: usize,
    pub min_train_size: usize,
}

/// Averaged walk-forward results
#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub folds_run: usize,
    pub average: ForecastAccuracy,
    /// Metrics over all folds' pairs pooled together. R² per fold is
    /// unstable when a test window happens to be nearly flat; the pooled
    /// figure is the robust one.
    pub pooled: ForecastAccuracy,
    pub per_fold: Vec<ForecastAccuracy>,
}

/// Walk-forward validation: each fold trains on a growing prefix and
/// forecasts the next `horizon` points. `forecast_fn` maps training values
/// and a horizon to point predictions.
pub fn walk_forward<F>(
    values: &[f64],
    config: &BacktestConfig,
    mut forecast_fn: F,
) -> Result<BacktestReport>
where
    F: FnMut(&[f64], usize) -> Result<Vec<f64>>,
{
    let n = values.len();
    if config.folds == 0 {
        return Err(Error::Validation("folds must be at least 1".to_string()));
    }
    if n < config.min_train_size + config.horizon {
        return Err(Error::InsufficientData(format!(
            "need at least {} points for min_train {} and horizon {}",
            config.min_train_size + config.horizon,
            config.min_train_size,
            config.horizon
        )));
    }

    let advance = (n - config.min_train_size - config.horizon) / config.folds;
    let mut per_fold = Vec::with_capacity(config.folds);
    let mut pooled_actuals = Vec::new();
    let mut pooled_predictions = Vec::new();

    for fold in 0..config.folds {
        let train_end = config.min_train_size + fold * advance;
        let test_end = train_end + config.horizon;
        if test_end > n {
            break;
        }
        let predictions = forecast_fn(&values[..train_end], config.horizon)?;
        let actuals = &values[train_end..test_end];
        pooled_actuals.extend_from_slice(actuals);
        pooled_predictions.extend(predictions.iter().copied().take(actuals.len()));
        let fold_accuracy = point_accuracy(actuals, &predictions);
        debug!(
            "fold {}: train {} points, mape {:.2}, r2 {:.3}",
            fold, train_end, fold_accuracy.mape, fold_accuracy.r2
        );
        per_fold.push(fold_accuracy);
    }

    if per_fold.is_empty() {
        return Err(Error::InsufficientData(
            "no folds could be evaluated".to_string(),
        ));
    }

    let folds_run = per_fold.len();
    let mut average = ForecastAccuracy::default();
    for fold in &per_fold {
        average.mae += fold.mae;
        average.mse += fold.mse;
        average.rmse += fold.rmse;
        average.mape += fold.mape;
        average.smape += fold.smape;
        average.r2 += fold.r2;
        average.pairs += fold.pairs;
    }
    let k = folds_run as f64;
    average.mae /= k;
    average.mse /= k;
    average.rmse /= k;
    average.mape /= k;
    average.smape /= k;
    average.r2 /= k;

    Ok(BacktestReport {
        folds_run,
        average,
        pooled: point_accuracy(&pooled_actuals, &pooled_predictions),
        per_fold,
    })
}

/// Parameters for the synthetic series generator
#[derive(Debug, Clone)]
pub struct BenchmarkSpec {
    pub len: usize,
    pub base: f64,
    /// Additive change per step
    pub trend: f64,
    pub seasonal_period: Option<usize>,
    pub seasonal_amplitude: f64,
    pub noise_std: f64,
    pub seed: u64,
}

impl Default for BenchmarkSpec {
    fn default() -> Self {
        Self {
            len: 200,
            base: 50.0,
            trend: 0.0,
            seasonal_period: None,
            seasonal_amplitude: 0.0,
            noise_std: 1.0,
            seed: 42,
        }
    }
}

/// Deterministic synthetic series with trend, seasonality and noise
pub fn generate_series(spec: &BenchmarkSpec) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(spec.seed);
    (0..spec.len)
        .map(|i| {
            let seasonal = match spec.seasonal_period {
                Some(period) if period > 0 => {
                    spec.seasonal_amplitude
                        * (2.0 * std::f64::consts::PI * i as f64 / period as f64).sin()
                }
                _ => 0.0,
            };
            let noise = if spec.noise_std > 0.0 {
                gaussian(&mut rng) * spec.noise_std
            } else {
                0.0
            };
            spec.base + spec.trend * i as f64 + seasonal + noise
        })
        .collect()
}

/// Outlier-injection benchmark: returns the series and the injected indices
pub fn anomaly_benchmark(
    spec: &BenchmarkSpec,
    rate: f64,
    magnitude: f64,
) -> (Vec<f64>, Vec<usize>) {
    let mut values = generate_series(spec);
    let mut rng = StdRng::seed_from_u64(spec.seed.wrapping_add(1));
    let mut labels = Vec::new();
    for (i, value) in values.iter_mut().enumerate() {
        // Keep the first points clean so detectors have a baseline.
        if i >= 5 && rng.gen::<f64>() < rate {
            let direction = if rng.gen::<bool>() { 1.0 } else { -1.0 };
            *value += direction * magnitude * spec.noise_std.max(1.0);
            labels.push(i);
        }
    }
    (values, labels)
}

/// Level-shift benchmark: shifts the mean at the midpoint and labels it
pub fn level_shift_benchmark(spec: &BenchmarkSpec, shift: f64) -> (Vec<f64>, usize) {
    let mut values = generate_series(spec);
    let midpoint = values.len() / 2;
    for value in values.iter_mut().skip(midpoint) {
        *value += shift;
    }
    (values, midpoint)
}

/// Box-Muller standard normal draw
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
