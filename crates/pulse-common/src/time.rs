//! Timestamp helpers
//!
//! Canonical timestamps are UTC with millisecond resolution, rendered as
//! RFC 3339 with a trailing `Z`. The rendered form sorts lexically in the
//! same order as the instants it encodes, which the metric store relies on
//! for range scans.

use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Render a timestamp in the canonical sortable form
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an ISO-8601 timestamp, truncating to millisecond resolution
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| Error::Validation(format!("invalid timestamp '{}': {}", raw, e)))?;
    Ok(truncate_to_millis(parsed.with_timezone(&Utc)))
}

/// Truncate a timestamp to millisecond resolution
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    let millis = ts.timestamp_millis();
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(ts)
}

/// Current instant at millisecond resolution
pub fn now_millis() -> DateTime<Utc> {
    truncate_to_millis(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_is_sortable() {
        let a = parse_timestamp("2025-01-01T00:00:00.000Z").unwrap();
        let b = parse_timestamp("2025-01-01T00:00:00.001Z").unwrap();
        let c = parse_timestamp("2025-01-02T00:00:00.000Z").unwrap();
        let mut rendered = vec![
            format_timestamp(c),
            format_timestamp(a),
            format_timestamp(b),
        ];
        rendered.sort();
        assert_eq!(
            rendered,
            vec![format_timestamp(a), format_timestamp(b), format_timestamp(c)]
        );
    }

    #[test]
    fn parse_accepts_offsets_and_normalizes_to_utc() {
        let ts = parse_timestamp("2025-01-01T02:00:00.500+02:00").unwrap();
        assert_eq!(format_timestamp(ts), "2025-01-01T00:00:00.500Z");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("2025-13-01T00:00:00Z").is_err());
    }

    #[test]
    fn sub_millisecond_precision_is_truncated() {
        let ts = parse_timestamp("2025-01-01T00:00:00.123456Z").unwrap();
        assert_eq!(format_timestamp(ts), "2025-01-01T00:00:00.123Z");
    }
}
