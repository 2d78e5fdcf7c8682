//! Persistence for forecast results, anomalies and forecast jobs

use crate::metric_store::storage_err;
use crate::pool::ConnectionPool;
use pulse_common::time::{format_timestamp, now_millis, parse_timestamp};
use pulse_common::{
    AnomalyPoint, AnomalySeverity, AnomalyType, DetectionResult, Dimensions, Error,
    ForecastResult, ModelInfo, Prediction, Result,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use uuid::Uuid;

/// Store for forecast and anomaly outputs
pub struct ForecastStore {
    pool: Arc<ConnectionPool>,
}

impl ForecastStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub async fn insert_forecast(&self, result: &ForecastResult) -> Result<()> {
        let predictions_json = serde_json::to_string(&result.predictions)?;
        let model_info_json = serde_json::to_string(&result.model_info)?;
        let dims_json = pulse_common::encode_dimensions(&result.dimensions);
        let r = result.clone();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO forecasts
                     (request_id, tenant_id, metric_key, dimensions_json, backend, horizon,
                      frequency, predictions_json, model_info_json, generated_at, duration_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9, ?10)",
                    params![
                        r.request_id.to_string(),
                        r.tenant_id,
                        r.metric_key,
                        dims_json,
                        r.backend,
                        r.horizon as i64,
                        predictions_json,
                        model_info_json,
                        format_timestamp(r.generated_at),
                        r.duration_ms as i64
                    ],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await
    }

    /// Latest forecast generated for a series identity
    pub async fn latest_forecast(
        &self,
        tenant_id: &str,
        metric_key: &str,
        dimensions: &Dimensions,
    ) -> Result<Option<ForecastResult>> {
        let tenant = tenant_id.to_string();
        let key = metric_key.to_string();
        let dims_json = pulse_common::encode_dimensions(dimensions);
        let row: Option<(String, String, i64, String, String, String, i64)> = self
            .pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT request_id, backend, horizon, predictions_json, model_info_json,
                            generated_at, duration_ms
                     FROM forecasts
                     WHERE tenant_id = ?1 AND metric_key = ?2 AND dimensions_json = ?3
                     ORDER BY generated_at DESC LIMIT 1",
                    params![tenant, key, dims_json],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    },
                )
                .optional()
                .map_err(storage_err)
            })
            .await?;

        match row {
            None => Ok(None),
            Some((request_id, backend, horizon, predictions_json, model_info_json, generated_at, duration_ms)) => {
                let predictions: Vec<Prediction> = serde_json::from_str(&predictions_json)?;
                let model_info: ModelInfo = serde_json::from_str(&model_info_json)?;
                Ok(Some(ForecastResult {
                    request_id: Uuid::parse_str(&request_id).unwrap_or_else(|_| Uuid::nil()),
                    tenant_id: tenant_id.to_string(),
                    metric_key: metric_key.to_string(),
                    dimensions: dimensions.clone(),
                    backend,
                    horizon: horizon.max(0) as usize,
                    predictions,
                    model_info,
                    generated_at: parse_timestamp(&generated_at)?,
                    duration_ms: duration_ms.max(0) as u64,
                }))
            }
        }
    }

    /// Persist every anomaly from a detection run
    pub async fn insert_detection(&self, result: &DetectionResult) -> Result<()> {
        let dims_json = pulse_common::encode_dimensions(&result.dimensions);
        let r = result.clone();
        self.pool
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(storage_err)?;
                {
                    let mut stmt = tx
                        .prepare_cached(
                            "INSERT OR REPLACE INTO anomalies
                             (anomaly_id, request_id, tenant_id, metric_key, dimensions_json,
                              timestamp, observed, expected, score, type, severity, description, detected_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                        )
                        .map_err(storage_err)?;
                    for anomaly in &r.anomalies {
                        stmt.execute(params![
                            anomaly.anomaly_id.to_string(),
                            r.request_id.to_string(),
                            r.tenant_id,
                            r.metric_key,
                            dims_json,
                            format_timestamp(anomaly.timestamp),
                            anomaly.observed,
                            anomaly.expected,
                            anomaly.score,
                            anomaly.anomaly_type.as_str(),
                            anomaly.severity.as_str(),
                            anomaly.description,
                            format_timestamp(r.detected_at)
                        ])
                        .map_err(storage_err)?;
                    }
                }
                tx.commit().map_err(storage_err)?;
                Ok(())
            })
            .await
    }

    /// Anomalies observed for a series identity since `since`
    pub async fn recent_anomalies(
        &self,
        tenant_id: &str,
        metric_key: &str,
        dimensions: &Dimensions,
        since: DateTime<Utc>,
    ) -> Result<Vec<AnomalyPoint>> {
        let tenant = tenant_id.to_string();
        let key = metric_key.to_string();
        let dims_json = pulse_common::encode_dimensions(dimensions);
        let since_str = format_timestamp(since);
        let rows = self
            .pool
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT anomaly_id, timestamp, observed, expected, score, type, severity, description
                         FROM anomalies
                         WHERE tenant_id = ?1 AND metric_key = ?2 AND dimensions_json = ?3
                           AND timestamp >= ?4
                         ORDER BY timestamp ASC",
                    )
                    .map_err(storage_err)?;
                let mapped = stmt
                    .query_map(params![tenant, key, dims_json, since_str], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, f64>(3)?,
                            row.get::<_, f64>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    })
                    .map_err(storage_err)?;
                let mut rows = Vec::new();
                for row in mapped {
                    rows.push(row.map_err(storage_err)?);
                }
                Ok(rows)
            })
            .await?;

        let mut anomalies = Vec::with_capacity(rows.len());
        for (index, (anomaly_id, timestamp, observed, expected, score, kind, severity, description)) in
            rows.into_iter().enumerate()
        {
            anomalies.push(AnomalyPoint {
                anomaly_id: Uuid::parse_str(&anomaly_id).unwrap_or_else(|_| Uuid::nil()),
                timestamp: parse_timestamp(&timestamp)?,
                index,
                observed,
                expected,
                score,
                severity: parse_anomaly_severity(&severity)?,
                anomaly_type: parse_anomaly_type(&kind)?,
                description,
                context: None,
            });
        }
        Ok(anomalies)
    }

    /// Record a queued forecast job
    pub async fn create_job(
        &self,
        tenant_id: &str,
        metric_key: &str,
        dimensions: &Dimensions,
        horizon: usize,
    ) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        let tenant = tenant_id.to_string();
        let key = metric_key.to_string();
        let dims_json = pulse_common::encode_dimensions(dimensions);
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO forecast_jobs
                     (job_id, tenant_id, metric_key, dimensions_json, horizon, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6)",
                    params![
                        job_id.to_string(),
                        tenant,
                        key,
                        dims_json,
                        horizon as i64,
                        format_timestamp(now_millis())
                    ],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await?;
        Ok(job_id)
    }

    /// Mark a job finished, successfully or with an error
    pub async fn finish_job(&self, job_id: Uuid, error: Option<&str>) -> Result<()> {
        let error = error.map(|e| e.to_string());
        self.pool
            .with_conn(move |conn| {
                let status = if error.is_some() { "failed" } else { "completed" };
                conn.execute(
                    "UPDATE forecast_jobs SET status = ?2, completed_at = ?3, error = ?4
                     WHERE job_id = ?1",
                    params![
                        job_id.to_string(),
                        status,
                        format_timestamp(now_millis()),
                        error
                    ],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await
    }
}

fn parse_anomaly_severity(raw: &str) -> Result<AnomalySeverity> {
    match raw {
        "low" => Ok(AnomalySeverity::Low),
        "medium" => Ok(AnomalySeverity::Medium),
        "high" => Ok(AnomalySeverity::High),
        "critical" => Ok(AnomalySeverity::Critical),
        other => Err(Error::Storage(format!("unknown anomaly severity '{}'", other))),
    }
}

fn parse_anomaly_type(raw: &str) -> Result<AnomalyType> {
    match raw {
        "point" => Ok(AnomalyType::Point),
        "collective" => Ok(AnomalyType::Collective),
        "trend_change" => Ok(AnomalyType::TrendChange),
        "level_shift" => Ok(AnomalyType::LevelShift),
        other => Err(Error::Storage(format!("unknown anomaly type '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::schema;
    use chrono::Duration;
    use pulse_common::time::now_millis;
    use pulse_common::{PredictionInterval, TrainingMetrics};
    use std::collections::BTreeMap;

    async fn test_store() -> (tempfile::TempDir, ForecastStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forecast.db");
        let pool = Arc::new(ConnectionPool::new(PoolConfig::new(
            path.to_string_lossy().to_string(),
        )));
        pool.with_conn(|conn| schema::bootstrap(conn)).await.unwrap();
        (dir, ForecastStore::new(pool))
    }

    fn sample_forecast(now: DateTime<Utc>) -> ForecastResult {
        let mut intervals = BTreeMap::new();
        intervals.insert(
            "0.95".to_string(),
            PredictionInterval {
                lower: 40.0,
                upper: 60.0,
            },
        );
        ForecastResult {
            request_id: Uuid::new_v4(),
            tenant_id: "acme".into(),
            metric_key: "system.cpu.usage".into(),
            dimensions: Dimensions::new(),
            backend: "holt_winters".into(),
            horizon: 1,
            predictions: vec![Prediction {
                timestamp: now + Duration::hours(1),
                value: 50.0,
                intervals,
            }],
            model_info: ModelInfo {
                name: "holt_winters".into(),
                version: "0.1.0".into(),
                training_metrics: TrainingMetrics {
                    mape: 4.2,
                    residual_std: 1.1,
                    alpha: 0.3,
                    beta: 0.1,
                    gamma: 0.0,
                    seasonal_period: None,
                    seasonal_strength: 0.0,
                    trend: 0.2,
                },
            },
            generated_at: now,
            duration_ms: 12,
        }
    }

    #[tokio::test]
    async fn forecast_round_trips() {
        let (_dir, store) = test_store().await;
        let now = now_millis();
        let forecast = sample_forecast(now);
        store.insert_forecast(&forecast).await.unwrap();

        let latest = store
            .latest_forecast("acme", "system.cpu.usage", &Dimensions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest, forecast);
    }

    #[tokio::test]
    async fn detection_rows_are_queryable_by_window() {
        let (_dir, store) = test_store().await;
        let now = now_millis();
        let detection = DetectionResult {
            request_id: Uuid::new_v4(),
            tenant_id: "acme".into(),
            metric_key: "system.cpu.usage".into(),
            dimensions: Dimensions::new(),
            backend: "ensemble".into(),
            anomalies: vec![AnomalyPoint {
                anomaly_id: Uuid::new_v4(),
                timestamp: now,
                index: 50,
                observed: 80.0,
                expected: 50.0,
                score: 0.9,
                severity: AnomalySeverity::High,
                anomaly_type: AnomalyType::LevelShift,
                description: "level shift".into(),
                context: None,
            }],
            detected_at: now,
            duration_ms: 5,
        };
        store.insert_detection(&detection).await.unwrap();

        let recent = store
            .recent_anomalies(
                "acme",
                "system.cpu.usage",
                &Dimensions::new(),
                now - Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].severity, AnomalySeverity::High);
        assert_eq!(recent[0].anomaly_type, AnomalyType::LevelShift);

        let none = store
            .recent_anomalies(
                "acme",
                "system.cpu.usage",
                &Dimensions::new(),
                now + Duration::hours(1),
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn jobs_track_completion() {
        let (_dir, store) = test_store().await;
        let job = store
            .create_job("acme", "system.cpu.usage", &Dimensions::new(), 24)
            .await
            .unwrap();
        store.finish_job(job, None).await.unwrap();
        store.finish_job(job, Some("backend offline")).await.unwrap();
    }
}
