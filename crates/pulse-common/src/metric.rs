//! Canonical metric model
//!
//! Every inbound point is rewritten into a [`MetricPoint`] before anything
//! else in the pipeline touches it. The identity of a point is the tuple
//! `(tenant_id, metric_key, timestamp, dimensions)`; duplicate inserts under
//! the same identity are coalesced by the store.

use crate::time::format_timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque tenant identifier
pub type TenantId = String;

/// Scalar value allowed in a dimension map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimensionValue {
    String(String),
    Bool(bool),
    Number(f64),
}

impl DimensionValue {
    pub fn is_finite(&self) -> bool {
        match self {
            DimensionValue::Number(n) => n.is_finite(),
            _ => true,
        }
    }
}

/// Dimensions keyed by lowercase snake-case names.
///
/// A `BTreeMap` keeps key order canonical, so two dimension maps with the
/// same entries always serialize to the same JSON.
pub type Dimensions = BTreeMap<String, DimensionValue>;

/// Where a point came from and what happened to it on the way in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: String,
    pub ingested_at: DateTime<Utc>,
    pub pipeline_version: String,
    pub transformations: Vec<String>,
}

/// Normalized, deduplicated unit of observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub tenant_id: TenantId,
    pub metric_key: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub dimensions: Dimensions,
    pub provenance: Provenance,
}

impl MetricPoint {
    /// Canonical JSON encoding of the dimension map, used in the identity
    /// tuple and as the stored `dimensions_json` column.
    pub fn dimensions_json(&self) -> String {
        encode_dimensions(&self.dimensions)
    }

    /// The identity tuple rendered as a single string
    pub fn identity(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.tenant_id,
            self.metric_key,
            format_timestamp(self.timestamp),
            self.dimensions_json()
        )
    }
}

/// Canonical JSON encoding for a dimension map
pub fn encode_dimensions(dimensions: &Dimensions) -> String {
    // BTreeMap iteration order makes this deterministic.
    serde_json::to_string(dimensions).unwrap_or_else(|_| "{}".to_string())
}

/// Series metadata computed on projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMeta {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub count: usize,
    /// Median inter-point gap in milliseconds, when derivable
    pub detected_resolution_ms: Option<i64>,
}

/// A single observation inside a series projection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Projection of canonical points sharing `(tenant, metric_key, dimensions)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub tenant_id: TenantId,
    pub metric_key: String,
    #[serde(default)]
    pub dimensions: Dimensions,
    pub points: Vec<SeriesPoint>,
    pub meta: SeriesMeta,
}

impl TimeSeries {
    /// Build a series from points already ordered by timestamp ascending
    pub fn from_points(
        tenant_id: TenantId,
        metric_key: String,
        dimensions: Dimensions,
        points: Vec<SeriesPoint>,
    ) -> Self {
        let meta = SeriesMeta {
            start: points.first().map(|p| p.timestamp),
            end: points.last().map(|p| p.timestamp),
            count: points.len(),
            detected_resolution_ms: detect_resolution(&points),
        };
        TimeSeries {
            tenant_id,
            metric_key,
            dimensions,
            points,
            meta,
        }
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Median inter-point gap, `None` below two points
fn detect_resolution(points: &[SeriesPoint]) -> Option<i64> {
    if points.len() < 2 {
        return None;
    }
    let mut gaps: Vec<i64> = points
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds())
        .filter(|g| *g > 0)
        .collect();
    if gaps.is_empty() {
        return None;
    }
    gaps.sort_unstable();
    Some(gaps[gaps.len() / 2])
}
