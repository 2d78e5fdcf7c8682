//! Normalization of inbound points into canonical metric records
//!
//! The normalizer rewrites metric keys and dimension keys into canonical
//! form, rejects malformed values with stable reason codes, and stamps
//! provenance. It never fails a whole batch: malformed items are reported
//! per index and the rest proceed.

use pulse_common::time::{now_millis, parse_timestamp};
use pulse_common::{
    DimensionValue, Dimensions, ErrorCode, IngestMetric, ItemError, MetricPoint, Provenance,
};
use tracing::debug;

/// One accepted item, carrying its index in the original batch
#[derive(Debug, Clone)]
pub struct AcceptedPoint {
    pub index: usize,
    pub point: MetricPoint,
}

/// Result of normalizing a batch
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub accepted: Vec<AcceptedPoint>,
    pub rejected: Vec<ItemError>,
}

/// Rewrites inbound items into canonical metric records
#[derive(Debug, Clone)]
pub struct Normalizer {
    pipeline_version: String,
}

impl Normalizer {
    pub fn new(pipeline_version: impl Into<String>) -> Self {
        Self {
            pipeline_version: pipeline_version.into(),
        }
    }

    /// Normalize a batch of items for one tenant and source
    pub fn normalize_batch(
        &self,
        tenant_id: &str,
        source_id: &str,
        items: &[IngestMetric],
    ) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for (index, item) in items.iter().enumerate() {
            match self.normalize_item(tenant_id, source_id, item) {
                Ok(point) => batch.accepted.push(AcceptedPoint { index, point }),
                Err((code, message)) => batch.rejected.push(ItemError {
                    index,
                    metric_key: Some(item.metric_key.clone()),
                    code,
                    message,
                }),
            }
        }
        debug!(
            "normalized batch for {}: {} accepted, {} rejected",
            tenant_id,
            batch.accepted.len(),
            batch.rejected.len()
        );
        batch
    }

    fn normalize_item(
        &self,
        tenant_id: &str,
        source_id: &str,
        item: &IngestMetric,
    ) -> std::result::Result<MetricPoint, (ErrorCode, String)> {
        let mut transformations = Vec::new();

        let metric_key = match canonicalize_metric_key(&item.metric_key) {
            Some(key) => {
                if key != item.metric_key {
                    transformations.push("metric_key_canonicalized".to_string());
                }
                key
            }
            None => {
                return Err((
                    ErrorCode::InvalidMetricKey,
                    format!("metric key '{}' cannot be canonicalized", item.metric_key),
                ))
            }
        };

        if !item.value.is_finite() {
            return Err((
                ErrorCode::InvalidValue,
                format!("value for '{}' is not finite", metric_key),
            ));
        }

        let timestamp = match &item.timestamp {
            Some(raw) => parse_timestamp(raw).map_err(|e| {
                (
                    ErrorCode::InvalidTimestamp,
                    format!("timestamp for '{}': {}", metric_key, e),
                )
            })?,
            None => {
                transformations.push("timestamp_defaulted".to_string());
                now_millis()
            }
        };

        let dimensions = match &item.dimensions {
            Some(raw) => {
                let (dimensions, rewritten) = normalize_dimensions(raw).map_err(|message| {
                    (
                        ErrorCode::InvalidDimensions,
                        format!("dimensions for '{}': {}", metric_key, message),
                    )
                })?;
                if rewritten {
                    transformations.push("dimension_keys_normalized".to_string());
                }
                dimensions
            }
            None => Dimensions::new(),
        };

        if item.tags.as_ref().map(|t| !t.is_empty()).unwrap_or(false) {
            transformations.push("tags_dropped".to_string());
        }

        Ok(MetricPoint {
            tenant_id: tenant_id.to_string(),
            metric_key,
            timestamp,
            value: item.value,
            dimensions,
            provenance: Provenance {
                source_id: source_id.to_string(),
                ingested_at: now_millis(),
                pipeline_version: self.pipeline_version.clone(),
                transformations,
            },
        })
    }
}

/// Rewrite a metric key into canonical form: lowercase, dot-separated
/// segments of `[a-z][a-z0-9_]*`, spaces and dashes folded to underscores.
/// Returns `None` when no valid canonical form exists.
pub fn canonicalize_metric_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut last_sep: Option<char> = None;
    for ch in trimmed.chars() {
        let mapped = match ch {
            'A'..='Z' => ch.to_ascii_lowercase(),
            'a'..='z' | '0'..='9' => ch,
            ' ' | '-' => '_',
            '.' | '_' => ch,
            _ => return None,
        };
        if mapped == '.' || mapped == '_' {
            // Collapse separator runs; a dot wins over an underscore.
            match last_sep {
                Some(prev) => {
                    if prev == '_' && mapped == '.' {
                        out.pop();
                        out.push('.');
                        last_sep = Some('.');
                    }
                }
                None => {
                    out.push(mapped);
                    last_sep = Some(mapped);
                }
            }
        } else {
            out.push(mapped);
            last_sep = None;
        }
    }

    let out = out.trim_matches(|c| c == '.' || c == '_').to_string();
    if out.is_empty() {
        return None;
    }
    if !out.chars().next().map(|c| c.is_ascii_lowercase()).unwrap_or(false) {
        return None;
    }
    // No empty segments between dots.
    if out.split('.').any(|segment| segment.is_empty()) {
        return None;
    }
    Some(out)
}

/// Lowercase a dimension key into snake-case; `None` when invalid
pub fn canonicalize_dimension_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut out = String::with_capacity(trimmed.len());
    for ch in trimmed.chars() {
        let mapped = match ch {
            'A'..='Z' => ch.to_ascii_lowercase(),
            'a'..='z' | '0'..='9' | '_' => ch,
            ' ' | '-' => '_',
            _ => return None,
        };
        out.push(mapped);
    }
    if !out.chars().next().map(|c| c.is_ascii_lowercase()).unwrap_or(false) {
        return None;
    }
    Some(out)
}

fn normalize_dimensions(
    raw: &std::collections::HashMap<String, serde_json::Value>,
) -> std::result::Result<(Dimensions, bool), String> {
    let mut dimensions = Dimensions::new();
    let mut rewritten = false;
    for (key, value) in raw {
        let canonical_key = canonicalize_dimension_key(key)
            .ok_or_else(|| format!("invalid dimension key '{}'", key))?;
        if canonical_key != *key {
            rewritten = true;
        }
        let scalar = match value {
            serde_json::Value::String(s) => DimensionValue::String(s.clone()),
            serde_json::Value::Bool(b) => DimensionValue::Bool(*b),
            serde_json::Value::Number(n) => {
                let n = n
                    .as_f64()
                    .ok_or_else(|| format!("dimension '{}' is not a finite number", canonical_key))?;
                if !n.is_finite() {
                    return Err(format!("dimension '{}' is not finite", canonical_key));
                }
                DimensionValue::Number(n)
            }
            other => {
                return Err(format!(
                    "dimension '{}' has unsupported type: {}",
                    canonical_key, other
                ))
            }
        };
        if dimensions.insert(canonical_key.clone(), scalar).is_some() {
            return Err(format!(
                "dimension key '{}' collides after normalization",
                canonical_key
            ));
        }
    }
    Ok((dimensions, rewritten))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn item(metric_key: &str, value: f64) -> IngestMetric {
        IngestMetric {
            metric_key: metric_key.into(),
            value,
            timestamp: Some("2025-01-01T00:00:00.000Z".into()),
            dimensions: None,
            tags: None,
        }
    }

    #[test]
    fn metric_keys_are_canonicalized() {
        assert_eq!(
            canonicalize_metric_key("System.CPU Usage"),
            Some("system.cpu_usage".into())
        );
        assert_eq!(
            canonicalize_metric_key("disk--io.read"),
            Some("disk_io.read".into())
        );
        assert_eq!(canonicalize_metric_key("a..b"), Some("a.b".into()));
        assert_eq!(canonicalize_metric_key(".leading.dot"), Some("leading.dot".into()));
        assert_eq!(canonicalize_metric_key("9starts.with.digit"), None);
        assert_eq!(canonicalize_metric_key("has/slash"), None);
        assert_eq!(canonicalize_metric_key(""), None);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for raw in ["System.CPU Usage", "disk--io.read", "a..b", "plain.key"] {
            let once = canonicalize_metric_key(raw).unwrap();
            let twice = canonicalize_metric_key(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn rejects_non_finite_values() {
        let normalizer = Normalizer::new("test");
        let batch = normalizer.normalize_batch(
            "acme",
            "s-1",
            &[item("system.cpu.usage", f64::NAN), item("system.cpu.usage", f64::INFINITY)],
        );
        assert!(batch.accepted.is_empty());
        assert_eq!(batch.rejected.len(), 2);
        assert!(batch
            .rejected
            .iter()
            .all(|e| e.code == ErrorCode::InvalidValue));
    }

    #[test]
    fn rejects_bad_timestamps_with_index() {
        let normalizer = Normalizer::new("test");
        let mut bad = item("system.cpu.usage", 1.0);
        bad.timestamp = Some("not-a-time".into());
        let batch = normalizer.normalize_batch("acme", "s-1", &[item("a.b", 0.0), bad]);
        assert_eq!(batch.accepted.len(), 1);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].index, 1);
        assert_eq!(batch.rejected[0].code, ErrorCode::InvalidTimestamp);
    }

    #[test]
    fn missing_timestamp_defaults_and_is_recorded() {
        let normalizer = Normalizer::new("test");
        let mut no_ts = item("system.cpu.usage", 1.0);
        no_ts.timestamp = None;
        let batch = normalizer.normalize_batch("acme", "s-1", &[no_ts]);
        let point = &batch.accepted[0].point;
        assert!(point
            .provenance
            .transformations
            .contains(&"timestamp_defaulted".to_string()));
    }

    #[test]
    fn dimension_keys_are_normalized_and_values_typed() {
        let normalizer = Normalizer::new("test");
        let mut dims = HashMap::new();
        dims.insert("Host-Name".to_string(), serde_json::json!("db-1"));
        dims.insert("core".to_string(), serde_json::json!(3));
        dims.insert("active".to_string(), serde_json::json!(true));
        let mut with_dims = item("system.cpu.usage", 1.0);
        with_dims.dimensions = Some(dims);

        let batch = normalizer.normalize_batch("acme", "s-1", &[with_dims]);
        assert_eq!(batch.accepted.len(), 1);
        let point = &batch.accepted[0].point;
        assert_eq!(
            point.dimensions.get("host_name"),
            Some(&DimensionValue::String("db-1".into()))
        );
        assert_eq!(
            point.dimensions.get("core"),
            Some(&DimensionValue::Number(3.0))
        );
        assert_eq!(
            point.dimensions.get("active"),
            Some(&DimensionValue::Bool(true))
        );
    }

    #[test]
    fn nested_dimension_values_are_rejected() {
        let normalizer = Normalizer::new("test");
        let mut dims = HashMap::new();
        dims.insert("nested".to_string(), serde_json::json!({"a": 1}));
        let mut with_dims = item("system.cpu.usage", 1.0);
        with_dims.dimensions = Some(dims);

        let batch = normalizer.normalize_batch("acme", "s-1", &[with_dims]);
        assert!(batch.accepted.is_empty());
        assert_eq!(batch.rejected[0].code, ErrorCode::InvalidDimensions);
    }

    #[test]
    fn provenance_is_stamped() {
        let normalizer = Normalizer::new("1.2.3");
        let batch = normalizer.normalize_batch("acme", "collector-7", &[item("a.b", 1.0)]);
        let point = &batch.accepted[0].point;
        assert_eq!(point.provenance.source_id, "collector-7");
        assert_eq!(point.provenance.pipeline_version, "1.2.3");
        // An already canonical item carries no rewrite markers.
        assert!(point.provenance.transformations.is_empty());
    }
}
