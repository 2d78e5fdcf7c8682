//! Canonical metric persistence and range queries

use crate::pool::ConnectionPool;
use pulse_common::time::{format_timestamp, now_millis, parse_timestamp};
use pulse_common::{
    encode_dimensions, Dimensions, Error, MetricPoint, Provenance, Result, SeriesPoint,
    TimeSeries,
};
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::sync::Arc;
use tracing::debug;

/// Outcome of a batch insert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreBatchOutcome {
    pub inserted: usize,
    /// Points whose identity tuple already existed; coalesced silently
    pub duplicates: usize,
}

/// Range query parameters
#[derive(Debug, Clone, Default)]
pub struct MetricQuery {
    pub tenant_id: String,
    pub metric_key: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Every filter key must equal the stored dimension value
    pub dimension_filters: Dimensions,
    pub limit: usize,
    pub offset: usize,
}

/// Store for canonical metric points
pub struct MetricStore {
    pool: Arc<ConnectionPool>,
    chunk_size: usize,
}

impl MetricStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            chunk_size: 100,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Make sure the tenant row exists
    pub async fn ensure_tenant(&self, tenant_id: &str) -> Result<()> {
        let tenant = tenant_id.to_string();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO organizations (tenant_id, created_at) VALUES (?1, ?2)",
                    params![tenant, format_timestamp(now_millis())],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await
    }

    /// Insert points in chunks; duplicates per identity tuple are ignored
    /// and reported, not errors.
    pub async fn store_batch(&self, points: &[MetricPoint]) -> Result<StoreBatchOutcome> {
        let mut outcome = StoreBatchOutcome::default();
        for chunk in points.chunks(self.chunk_size) {
            let rows: Vec<_> = chunk.iter().map(point_row).collect();
            let chunk_len = rows.len();
            let inserted = self
                .pool
                .with_conn(move |conn| {
                    let tx = conn.transaction().map_err(storage_err)?;
                    let mut inserted = 0usize;
                    {
                        let mut stmt = tx
                            .prepare_cached(
                                "INSERT OR IGNORE INTO metrics
                                 (tenant_id, metric_key, timestamp, value, dimensions_json, provenance_json)
                                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                            )
                            .map_err(storage_err)?;
                        for row in &rows {
                            inserted += stmt
                                .execute(params![
                                    row.tenant_id,
                                    row.metric_key,
                                    row.timestamp,
                                    row.value,
                                    row.dimensions_json,
                                    row.provenance_json
                                ])
                                .map_err(storage_err)?;
                        }
                    }
                    tx.commit().map_err(storage_err)?;
                    Ok(inserted)
                })
                .await?;
            outcome.inserted += inserted;
            outcome.duplicates += chunk_len - inserted;
        }
        debug!(
            "stored batch: {} inserted, {} duplicates",
            outcome.inserted, outcome.duplicates
        );
        Ok(outcome)
    }

    /// Insert a single point; returns false when it was a duplicate
    pub async fn store_point(&self, point: &MetricPoint) -> Result<bool> {
        let outcome = self.store_batch(std::slice::from_ref(point)).await?;
        Ok(outcome.inserted == 1)
    }

    /// Range query ordered by timestamp ascending.
    ///
    /// Dimension filters are applied in memory after the indexed range
    /// scan, so limit and offset move to the filtered set when filters are
    /// present.
    pub async fn query(&self, query: &MetricQuery) -> Result<Vec<MetricPoint>> {
        let filtered_in_memory = !query.dimension_filters.is_empty();
        let (sql, args) = build_query_sql(query, filtered_in_memory);

        let rows = self
            .pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
                let mapped = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), row_to_point)
                    .map_err(storage_err)?;
                let mut rows = Vec::new();
                for row in mapped {
                    rows.push(row.map_err(storage_err)?);
                }
                Ok(rows)
            })
            .await?;

        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            points.push(row.into_point()?);
        }

        if filtered_in_memory {
            let filters = &query.dimension_filters;
            let filtered = points
                .into_iter()
                .filter(|p| {
                    filters
                        .iter()
                        .all(|(k, v)| p.dimensions.get(k) == Some(v))
                })
                .skip(query.offset)
                .take(if query.limit == 0 { usize::MAX } else { query.limit })
                .collect();
            Ok(filtered)
        } else {
            Ok(points)
        }
    }

    /// Project points sharing `(tenant, metric_key, dimensions)` into an
    /// ordered series with metadata.
    pub async fn as_series(
        &self,
        tenant_id: &str,
        metric_key: &str,
        dimensions: &Dimensions,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<TimeSeries> {
        let dims_json = encode_dimensions(dimensions);
        let mut sql = String::from(
            "SELECT timestamp, value FROM metrics
             WHERE tenant_id = ?1 AND metric_key = ?2 AND dimensions_json = ?3",
        );
        let mut args: Vec<String> =
            vec![tenant_id.to_string(), metric_key.to_string(), dims_json];
        if let Some(start) = start {
            args.push(format_timestamp(start));
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
        }
        if let Some(end) = end {
            args.push(format_timestamp(end));
            sql.push_str(&format!(" AND timestamp <= ?{}", args.len()));
        }
        sql.push_str(" ORDER BY timestamp ASC");

        let raw = self
            .pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
                let mapped = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                    })
                    .map_err(storage_err)?;
                let mut rows = Vec::new();
                for row in mapped {
                    rows.push(row.map_err(storage_err)?);
                }
                Ok(rows)
            })
            .await?;

        let mut points = Vec::with_capacity(raw.len());
        for (ts, value) in raw {
            points.push(SeriesPoint {
                timestamp: parse_timestamp(&ts)?,
                value,
            });
        }

        Ok(TimeSeries::from_points(
            tenant_id.to_string(),
            metric_key.to_string(),
            dimensions.clone(),
            points,
        ))
    }

    /// Latest stored timestamp for a series identity, if any
    pub async fn last_seen(
        &self,
        tenant_id: &str,
        metric_key: &str,
        dimensions: &Dimensions,
    ) -> Result<Option<DateTime<Utc>>> {
        let dims_json = encode_dimensions(dimensions);
        let tenant = tenant_id.to_string();
        let key = metric_key.to_string();
        let raw: Option<String> = self
            .pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT MAX(timestamp) FROM metrics
                     WHERE tenant_id = ?1 AND metric_key = ?2 AND dimensions_json = ?3",
                    params![tenant, key, dims_json],
                    |row| row.get(0),
                )
                .map_err(storage_err)
            })
            .await?;
        match raw {
            Some(ts) => Ok(Some(parse_timestamp(&ts)?)),
            None => Ok(None),
        }
    }

    /// Total stored points for a tenant (used by tests and stats surfaces)
    pub async fn count(&self, tenant_id: &str) -> Result<u64> {
        let tenant = tenant_id.to_string();
        self.pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM metrics WHERE tenant_id = ?1",
                    params![tenant],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as u64)
                .map_err(storage_err)
            })
            .await
    }
}

pub(crate) fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

struct PointRow {
    tenant_id: String,
    metric_key: String,
    timestamp: String,
    value: f64,
    dimensions_json: String,
    provenance_json: String,
}

impl PointRow {
    fn into_point(self) -> Result<MetricPoint> {
        let dimensions: Dimensions = serde_json::from_str(&self.dimensions_json)?;
        let provenance: Provenance = serde_json::from_str(&self.provenance_json)?;
        Ok(MetricPoint {
            tenant_id: self.tenant_id,
            metric_key: self.metric_key,
            timestamp: parse_timestamp(&self.timestamp)?,
            value: self.value,
            dimensions,
            provenance,
        })
    }
}

fn point_row(point: &MetricPoint) -> PointRow {
    PointRow {
        tenant_id: point.tenant_id.clone(),
        metric_key: point.metric_key.clone(),
        timestamp: format_timestamp(point.timestamp),
        value: point.value,
        dimensions_json: point.dimensions_json(),
        provenance_json: serde_json::to_string(&point.provenance)
            .unwrap_or_else(|_| "{}".to_string()),
    }
}

fn row_to_point(row: &rusqlite::Row<'_>) -> rusqlite::Result<PointRow> {
    Ok(PointRow {
        tenant_id: row.get(0)?,
        metric_key: row.get(1)?,
        timestamp: row.get(2)?,
        value: row.get(3)?,
        dimensions_json: row.get(4)?,
        provenance_json: row.get(5)?,
    })
}

fn build_query_sql(query: &MetricQuery, skip_paging: bool) -> (String, Vec<String>) {
    let mut sql = String::from(
        "SELECT tenant_id, metric_key, timestamp, value, dimensions_json, provenance_json
         FROM metrics WHERE tenant_id = ?1",
    );
    let mut args = vec![query.tenant_id.clone()];
    if let Some(key) = &query.metric_key {
        args.push(key.clone());
        sql.push_str(&format!(" AND metric_key = ?{}", args.len()));
    }
    if let Some(start) = query.start {
        args.push(format_timestamp(start));
        sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
    }
    if let Some(end) = query.end {
        args.push(format_timestamp(end));
        sql.push_str(&format!(" AND timestamp <= ?{}", args.len()));
    }
    sql.push_str(" ORDER BY timestamp ASC");
    if !skip_paging {
        if query.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", query.limit));
        }
        if query.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", query.offset));
        }
    }
    (sql, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::schema;
    use pulse_common::DimensionValue;

    async fn test_store() -> (tempfile::TempDir, MetricStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        let pool = Arc::new(ConnectionPool::new(PoolConfig::new(
            path.to_string_lossy().to_string(),
        )));
        pool.with_conn(|conn| schema::bootstrap(conn)).await.unwrap();
        (dir, MetricStore::new(pool))
    }

    fn sample_point(ts: &str, value: f64, host: &str) -> MetricPoint {
        let mut dimensions = Dimensions::new();
        dimensions.insert("host".into(), DimensionValue::String(host.into()));
        MetricPoint {
            tenant_id: "acme".into(),
            metric_key: "system.cpu.usage".into(),
            timestamp: parse_timestamp(ts).unwrap(),
            value,
            dimensions,
            provenance: Provenance {
                source_id: "collector-1".into(),
                ingested_at: now_millis(),
                pipeline_version: "0.1.0".into(),
                transformations: vec![],
            },
        }
    }

    #[tokio::test]
    async fn duplicate_identity_is_coalesced() {
        let (_dir, store) = test_store().await;
        let p = sample_point("2025-01-01T00:00:00.000Z", 42.0, "db-1");

        let first = store.store_batch(&[p.clone()]).await.unwrap();
        assert_eq!(first.inserted, 1);
        assert_eq!(first.duplicates, 0);

        let second = store.store_batch(&[p.clone()]).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 1);

        assert_eq!(store.count("acme").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_timestamp_different_dimensions_are_distinct() {
        let (_dir, store) = test_store().await;
        let a = sample_point("2025-01-01T00:00:00.000Z", 42.0, "db-1");
        let b = sample_point("2025-01-01T00:00:00.000Z", 42.0, "db-2");
        let outcome = store.store_batch(&[a, b]).await.unwrap();
        assert_eq!(outcome.inserted, 2);
    }

    #[tokio::test]
    async fn query_orders_by_timestamp_and_filters_dimensions() {
        let (_dir, store) = test_store().await;
        store
            .store_batch(&[
                sample_point("2025-01-01T00:02:00.000Z", 3.0, "db-1"),
                sample_point("2025-01-01T00:00:00.000Z", 1.0, "db-1"),
                sample_point("2025-01-01T00:01:00.000Z", 2.0, "db-2"),
            ])
            .await
            .unwrap();

        let all = store
            .query(&MetricQuery {
                tenant_id: "acme".into(),
                metric_key: Some("system.cpu.usage".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let mut filters = Dimensions::new();
        filters.insert("host".into(), DimensionValue::String("db-1".into()));
        let filtered = store
            .query(&MetricQuery {
                tenant_id: "acme".into(),
                metric_key: Some("system.cpu.usage".into()),
                dimension_filters: filters,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].value, 1.0);
    }

    #[tokio::test]
    async fn series_projection_carries_metadata() {
        let (_dir, store) = test_store().await;
        store
            .store_batch(&[
                sample_point("2025-01-01T00:00:00.000Z", 1.0, "db-1"),
                sample_point("2025-01-01T00:01:00.000Z", 2.0, "db-1"),
                sample_point("2025-01-01T00:02:00.000Z", 3.0, "db-1"),
            ])
            .await
            .unwrap();

        let mut dims = Dimensions::new();
        dims.insert("host".into(), DimensionValue::String("db-1".into()));
        let series = store
            .as_series("acme", "system.cpu.usage", &dims, None, None)
            .await
            .unwrap();
        assert_eq!(series.meta.count, 3);
        assert_eq!(series.meta.detected_resolution_ms, Some(60_000));
        assert_eq!(series.values(), vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn last_seen_tracks_latest_point() {
        let (_dir, store) = test_store().await;
        assert!(store
            .last_seen("acme", "system.cpu.usage", &Dimensions::new())
            .await
            .unwrap()
            .is_none());

        let p = sample_point("2025-01-01T00:05:00.000Z", 9.0, "db-1");
        let mut dims = Dimensions::new();
        dims.insert("host".into(), DimensionValue::String("db-1".into()));
        store.store_point(&p).await.unwrap();
        let seen = store
            .last_seen("acme", "system.cpu.usage", &dims)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(format_timestamp(seen), "2025-01-01T00:05:00.000Z");
    }
}
