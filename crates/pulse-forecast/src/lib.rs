//! Forecasting and anomaly detection for the Pulsewatch pipeline
//!
//! A registry of named backends fronts the statistical Holt-Winters
//! forecaster, the ensemble anomaly detector, and remote model clients.
//! The evaluator provides accuracy metrics, walk-forward backtesting and
//! synthetic benchmark data.

pub mod anomaly;
pub mod backend;
pub mod evaluator;
pub mod holt_winters;
pub mod registry;
pub mod remote;

pub use anomaly::{DetectorConfig, EnsembleDetector, ScoredAnomaly};
pub use backend::{BackendHealth, DetectionRequest, ForecastBackend, NoopBackend};
pub use evaluator::{
    anomaly_benchmark, evaluate_anomalies, evaluate_forecast, generate_series,
    level_shift_benchmark, point_accuracy, walk_forward, AnomalyAccuracy, BacktestConfig,
    BacktestReport, BenchmarkSpec, ForecastAccuracy,
};
pub use holt_winters::{describe_series, HoltWintersForecaster, SeriesProfile};
pub use registry::{BackendRegistration, BackendRegistry};
pub use remote::RemoteForecastClient;
