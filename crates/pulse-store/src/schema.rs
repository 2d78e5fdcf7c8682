//! Schema bootstrap for the backing relational store

use pulse_common::{Error, Result};
use rusqlite::Connection;
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS organizations (
    tenant_id   TEXT PRIMARY KEY,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS metrics (
    tenant_id        TEXT NOT NULL,
    metric_key       TEXT NOT NULL,
    timestamp        TEXT NOT NULL,
    value            REAL NOT NULL,
    dimensions_json  TEXT NOT NULL,
    provenance_json  TEXT NOT NULL,
    PRIMARY KEY (tenant_id, metric_key, timestamp, dimensions_json)
);

CREATE INDEX IF NOT EXISTS idx_metrics_range
    ON metrics (tenant_id, metric_key, timestamp);

CREATE TABLE IF NOT EXISTS forecasts (
    request_id       TEXT PRIMARY KEY,
    tenant_id        TEXT NOT NULL,
    metric_key       TEXT NOT NULL,
    dimensions_json  TEXT NOT NULL,
    backend          TEXT NOT NULL,
    horizon          INTEGER NOT NULL,
    frequency        TEXT,
    predictions_json TEXT NOT NULL,
    model_info_json  TEXT NOT NULL,
    generated_at     TEXT NOT NULL,
    duration_ms      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_forecasts_series
    ON forecasts (tenant_id, metric_key, generated_at);

CREATE TABLE IF NOT EXISTS anomalies (
    anomaly_id       TEXT PRIMARY KEY,
    request_id       TEXT NOT NULL,
    tenant_id        TEXT NOT NULL,
    metric_key       TEXT NOT NULL,
    dimensions_json  TEXT NOT NULL,
    timestamp        TEXT NOT NULL,
    observed         REAL NOT NULL,
    expected         REAL NOT NULL,
    score            REAL NOT NULL,
    type             TEXT NOT NULL,
    severity         TEXT NOT NULL,
    description      TEXT NOT NULL,
    detected_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_anomalies_series
    ON anomalies (tenant_id, metric_key, timestamp);

CREATE TABLE IF NOT EXISTS alert_rules (
    rule_id     TEXT PRIMARY KEY,
    tenant_id   TEXT NOT NULL,
    metric_key  TEXT NOT NULL,
    enabled     INTEGER NOT NULL,
    rule_json   TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alert_rules_tenant
    ON alert_rules (tenant_id);

CREATE TABLE IF NOT EXISTS alert_states (
    alert_id           TEXT PRIMARY KEY,
    tenant_id          TEXT NOT NULL,
    rule_id            TEXT NOT NULL,
    severity           TEXT NOT NULL,
    status             TEXT NOT NULL,
    triggered_at       TEXT NOT NULL,
    acknowledged_at    TEXT,
    acknowledged_by    TEXT,
    resolved_at        TEXT,
    resolved_by        TEXT,
    escalated_at       TEXT,
    escalation_level   INTEGER NOT NULL DEFAULT 0,
    notification_count INTEGER NOT NULL DEFAULT 0,
    last_notified_at   TEXT
);

CREATE INDEX IF NOT EXISTS idx_alert_states_tenant_status
    ON alert_states (tenant_id, status);

CREATE TABLE IF NOT EXISTS alert_transitions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_id    TEXT NOT NULL,
    from_status TEXT NOT NULL,
    to_status   TEXT NOT NULL,
    at          TEXT NOT NULL,
    actor       TEXT,
    reason      TEXT
);

CREATE INDEX IF NOT EXISTS idx_alert_transitions_alert
    ON alert_transitions (alert_id, at);

CREATE TABLE IF NOT EXISTS alert_dedup (
    dedup_key          TEXT PRIMARY KEY,
    tenant_id          TEXT NOT NULL,
    first_alert_id     TEXT NOT NULL,
    first_triggered_at TEXT NOT NULL,
    expires_at         TEXT NOT NULL,
    count              INTEGER NOT NULL DEFAULT 1,
    created_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alert_dedup_tenant_created
    ON alert_dedup (tenant_id, created_at);

CREATE TABLE IF NOT EXISTS forecast_jobs (
    job_id          TEXT PRIMARY KEY,
    tenant_id       TEXT NOT NULL,
    metric_key      TEXT NOT NULL,
    dimensions_json TEXT NOT NULL,
    horizon         INTEGER NOT NULL,
    status          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT,
    error           TEXT
);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    key               TEXT PRIMARY KEY,
    request_id        TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    expires_at        TEXT NOT NULL,
    original_response TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_idempotency_expiry
    ON idempotency_keys (expires_at);

CREATE TABLE IF NOT EXISTS dead_letter (
    id               TEXT PRIMARY KEY,
    original_request TEXT NOT NULL,
    error            TEXT NOT NULL,
    failed_at        TEXT NOT NULL,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    next_retry_at    TEXT NOT NULL,
    status           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dead_letter_due
    ON dead_letter (status, next_retry_at);
"#;

/// Create all tables and indexes when missing
pub fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .map_err(|e| Error::Storage(format!("schema bootstrap failed: {}", e)))?;
    debug!("schema bootstrap complete");
    Ok(())
}
