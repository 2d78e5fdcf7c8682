//! Persistence for alert rules, lifecycle state, transitions and dedup

use crate::metric_store::storage_err;
use crate::pool::ConnectionPool;
use pulse_common::time::{format_timestamp, now_millis, parse_timestamp};
use pulse_common::{
    AlertRule, AlertState, AlertStatus, AlertTransition, DedupRecord, Error, Result, Severity,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Per-tenant alert statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenantAlertStats {
    pub by_status: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
    /// Mean time to resolve, milliseconds
    pub mttr_ms: Option<f64>,
    /// Mean time to first response (acknowledgement), milliseconds
    pub mtfr_ms: Option<f64>,
}

/// Store for alert rules, states, transitions and dedup records
pub struct AlertStore {
    pool: Arc<ConnectionPool>,
}

impl AlertStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    // --- rules ---

    pub async fn upsert_rule(&self, rule: &AlertRule) -> Result<()> {
        let rule_json = serde_json::to_string(rule)?;
        let rule = rule.clone();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO alert_rules
                     (rule_id, tenant_id, metric_key, enabled, rule_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        rule.rule_id,
                        rule.tenant_id,
                        rule.metric_key,
                        rule.enabled as i64,
                        rule_json,
                        format_timestamp(now_millis())
                    ],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<bool> {
        let rule_id = rule_id.to_string();
        let removed = self
            .pool
            .with_conn(move |conn| {
                conn.execute("DELETE FROM alert_rules WHERE rule_id = ?1", params![rule_id])
                    .map_err(storage_err)
            })
            .await?;
        Ok(removed > 0)
    }

    /// All rules, or a single tenant's rules
    pub async fn load_rules(&self, tenant_id: Option<&str>) -> Result<Vec<AlertRule>> {
        let tenant = tenant_id.map(|t| t.to_string());
        let rows: Vec<String> = self
            .pool
            .with_conn(move |conn| {
                let mut rows = Vec::new();
                match &tenant {
                    Some(tenant) => {
                        let mut stmt = conn
                            .prepare("SELECT rule_json FROM alert_rules WHERE tenant_id = ?1")
                            .map_err(storage_err)?;
                        let mapped = stmt
                            .query_map(params![tenant], |row| row.get(0))
                            .map_err(storage_err)?;
                        for row in mapped {
                            rows.push(row.map_err(storage_err)?);
                        }
                    }
                    None => {
                        let mut stmt = conn
                            .prepare("SELECT rule_json FROM alert_rules")
                            .map_err(storage_err)?;
                        let mapped = stmt
                            .query_map([], |row| row.get(0))
                            .map_err(storage_err)?;
                        for row in mapped {
                            rows.push(row.map_err(storage_err)?);
                        }
                    }
                }
                Ok(rows)
            })
            .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for json in rows {
            rules.push(serde_json::from_str(&json)?);
        }
        Ok(rules)
    }

    // --- alert states ---

    /// Write-through upsert of an alert state row
    pub async fn put_state(&self, state: &AlertState) -> Result<()> {
        let s = state.clone();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO alert_states
                     (alert_id, tenant_id, rule_id, severity, status, triggered_at,
                      acknowledged_at, acknowledged_by, resolved_at, resolved_by,
                      escalated_at, escalation_level, notification_count, last_notified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        s.alert_id.to_string(),
                        s.tenant_id,
                        s.rule_id,
                        s.severity.as_str(),
                        s.status.as_str(),
                        format_timestamp(s.triggered_at),
                        s.acknowledged_at.map(format_timestamp),
                        s.acknowledged_by,
                        s.resolved_at.map(format_timestamp),
                        s.resolved_by,
                        s.escalated_at.map(format_timestamp),
                        s.escalation_level,
                        s.notification_count,
                        s.last_notified_at.map(format_timestamp),
                    ],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await
    }

    pub async fn get_state(&self, alert_id: Uuid) -> Result<Option<AlertState>> {
        let row = self
            .pool
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("{} WHERE alert_id = ?1", STATE_SELECT),
                    params![alert_id.to_string()],
                    row_to_state,
                )
                .optional()
                .map_err(storage_err)
            })
            .await?;
        row.map(decode_state).transpose()
    }

    /// Unhandled alerts triggered before `cutoff` with room to escalate.
    /// Already-escalated alerts stay eligible so unacknowledged alerts
    /// keep climbing until `max_level`.
    pub async fn escalation_candidates(
        &self,
        cutoff: DateTime<Utc>,
        max_level: u32,
    ) -> Result<Vec<AlertState>> {
        let cutoff_str = format_timestamp(cutoff);
        let rows = self
            .pool
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "{} WHERE status IN ('firing', 'escalated')
                         AND triggered_at < ?1 AND escalation_level < ?2",
                        STATE_SELECT
                    ))
                    .map_err(storage_err)?;
                let mapped = stmt
                    .query_map(params![cutoff_str, max_level], row_to_state)
                    .map_err(storage_err)?;
                let mut rows = Vec::new();
                for row in mapped {
                    rows.push(row.map_err(storage_err)?);
                }
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode_state).collect()
    }

    /// Active alerts that have never been notified or not since `cutoff`
    pub async fn reminder_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<AlertState>> {
        let cutoff_str = format_timestamp(cutoff);
        let rows = self
            .pool
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "{} WHERE status IN ('firing', 'escalated')
                         AND (last_notified_at IS NULL OR last_notified_at < ?1)",
                        STATE_SELECT
                    ))
                    .map_err(storage_err)?;
                let mapped = stmt
                    .query_map(params![cutoff_str], row_to_state)
                    .map_err(storage_err)?;
                let mut rows = Vec::new();
                for row in mapped {
                    rows.push(row.map_err(storage_err)?);
                }
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode_state).collect()
    }

    // --- transitions ---

    pub async fn append_transition(&self, transition: &AlertTransition) -> Result<()> {
        let t = transition.clone();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO alert_transitions (alert_id, from_status, to_status, at, actor, reason)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        t.alert_id.to_string(),
                        t.from.as_str(),
                        t.to.as_str(),
                        format_timestamp(t.at),
                        t.actor,
                        t.reason
                    ],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await
    }

    pub async fn transitions_for(&self, alert_id: Uuid) -> Result<Vec<AlertTransition>> {
        let rows: Vec<(String, String, String, String, Option<String>, Option<String>)> = self
            .pool
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT alert_id, from_status, to_status, at, actor, reason
                         FROM alert_transitions WHERE alert_id = ?1 ORDER BY id ASC",
                    )
                    .map_err(storage_err)?;
                let mapped = stmt
                    .query_map(params![alert_id.to_string()], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
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

        let mut transitions = Vec::with_capacity(rows.len());
        for (alert_id, from, to, at, actor, reason) in rows {
            transitions.push(AlertTransition {
                alert_id: Uuid::parse_str(&alert_id).unwrap_or_else(|_| Uuid::nil()),
                from: parse_status(&from)?,
                to: parse_status(&to)?,
                at: parse_timestamp(&at)?,
                actor,
                reason,
            });
        }
        Ok(transitions)
    }

    // --- dedup records ---

    /// Fetch a live (unexpired) dedup record
    pub async fn get_dedup(
        &self,
        dedup_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DedupRecord>> {
        let key = dedup_key.to_string();
        let now_str = format_timestamp(now);
        let row: Option<(String, String, String, String, String, i64)> = self
            .pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT dedup_key, tenant_id, first_alert_id, first_triggered_at, expires_at, count
                     FROM alert_dedup WHERE dedup_key = ?1 AND expires_at > ?2",
                    params![key, now_str],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )
                .optional()
                .map_err(storage_err)
            })
            .await?;

        match row {
            None => Ok(None),
            Some((dedup_key, tenant_id, first_alert_id, first_triggered_at, expires_at, count)) => {
                Ok(Some(DedupRecord {
                    dedup_key,
                    tenant_id,
                    first_alert_id: Uuid::parse_str(&first_alert_id)
                        .unwrap_or_else(|_| Uuid::nil()),
                    first_triggered_at: parse_timestamp(&first_triggered_at)?,
                    expires_at: parse_timestamp(&expires_at)?,
                    count: count.max(0) as u64,
                }))
            }
        }
    }

    /// Insert a fresh dedup record (replacing an expired row, if present)
    pub async fn insert_dedup(&self, record: &DedupRecord) -> Result<()> {
        let r = record.clone();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO alert_dedup
                     (dedup_key, tenant_id, first_alert_id, first_triggered_at, expires_at, count, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        r.dedup_key,
                        r.tenant_id,
                        r.first_alert_id.to_string(),
                        format_timestamp(r.first_triggered_at),
                        format_timestamp(r.expires_at),
                        r.count as i64,
                        format_timestamp(now_millis())
                    ],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await
    }

    /// Atomically increment a dedup record's hit count, returning the new
    /// count. Counts only move up.
    pub async fn increment_dedup(&self, dedup_key: &str) -> Result<u64> {
        let key = dedup_key.to_string();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE alert_dedup SET count = count + 1 WHERE dedup_key = ?1",
                    params![key.clone()],
                )
                .map_err(storage_err)?;
                conn.query_row(
                    "SELECT count FROM alert_dedup WHERE dedup_key = ?1",
                    params![key],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n.max(0) as u64)
                .map_err(storage_err)
            })
            .await
    }

    /// Dedup records created for a tenant since `since` (the rate-limit
    /// counter; a lower bound on dispatched alerts).
    pub async fn count_dedup_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<u64> {
        let tenant = tenant_id.to_string();
        let since_str = format_timestamp(since);
        self.pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM alert_dedup WHERE tenant_id = ?1 AND created_at >= ?2",
                    params![tenant, since_str],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as u64)
                .map_err(storage_err)
            })
            .await
    }

    /// Delete expired dedup records
    pub async fn cleanup_dedup(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_str = format_timestamp(now);
        let removed = self
            .pool
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM alert_dedup WHERE expires_at <= ?1",
                    params![now_str],
                )
                .map_err(storage_err)
            })
            .await?;
        if removed > 0 {
            debug!("removed {} expired dedup record(s)", removed);
        }
        Ok(removed)
    }

    // --- statistics ---

    pub async fn tenant_stats(&self, tenant_id: &str) -> Result<TenantAlertStats> {
        let tenant = tenant_id.to_string();
        let rows = self
            .pool
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT status, severity, triggered_at, acknowledged_at, resolved_at
                         FROM alert_states WHERE tenant_id = ?1",
                    )
                    .map_err(storage_err)?;
                let mapped = stmt
                    .query_map(params![tenant], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
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

        let mut stats = TenantAlertStats::default();
        let mut resolve_durations = Vec::new();
        let mut ack_durations = Vec::new();

        for (status, severity, triggered_at, acknowledged_at, resolved_at) in rows {
            *stats.by_status.entry(status).or_insert(0) += 1;
            *stats.by_severity.entry(severity).or_insert(0) += 1;
            let triggered = parse_timestamp(&triggered_at)?;
            if let Some(resolved) = resolved_at {
                let resolved = parse_timestamp(&resolved)?;
                resolve_durations.push((resolved - triggered).num_milliseconds() as f64);
            }
            if let Some(acked) = acknowledged_at {
                let acked = parse_timestamp(&acked)?;
                ack_durations.push((acked - triggered).num_milliseconds() as f64);
            }
        }

        stats.mttr_ms = mean(&resolve_durations);
        stats.mtfr_ms = mean(&ack_durations);
        Ok(stats)
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

const STATE_SELECT: &str = "SELECT alert_id, tenant_id, rule_id, severity, status, triggered_at,
    acknowledged_at, acknowledged_by, resolved_at, resolved_by,
    escalated_at, escalation_level, notification_count, last_notified_at
    FROM alert_states";

#[allow(clippy::type_complexity)]
type StateRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    u32,
    u32,
    Option<String>,
);

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn decode_state(row: StateRow) -> Result<AlertState> {
    let (
        alert_id,
        tenant_id,
        rule_id,
        severity,
        status,
        triggered_at,
        acknowledged_at,
        acknowledged_by,
        resolved_at,
        resolved_by,
        escalated_at,
        escalation_level,
        notification_count,
        last_notified_at,
    ) = row;
    Ok(AlertState {
        alert_id: Uuid::parse_str(&alert_id).unwrap_or_else(|_| Uuid::nil()),
        tenant_id,
        rule_id,
        severity: parse_severity(&severity)?,
        status: parse_status(&status)?,
        triggered_at: parse_timestamp(&triggered_at)?,
        acknowledged_at: acknowledged_at.as_deref().map(parse_timestamp).transpose()?,
        acknowledged_by,
        resolved_at: resolved_at.as_deref().map(parse_timestamp).transpose()?,
        resolved_by,
        escalated_at: escalated_at.as_deref().map(parse_timestamp).transpose()?,
        escalation_level,
        notification_count,
        last_notified_at: last_notified_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn parse_status(raw: &str) -> Result<AlertStatus> {
    AlertStatus::parse(raw)
        .ok_or_else(|| Error::Storage(format!("unknown alert status '{}'", raw)))
}

fn parse_severity(raw: &str) -> Result<Severity> {
    match raw {
        "info" => Ok(Severity::Info),
        "warning" => Ok(Severity::Warning),
        "error" => Ok(Severity::Error),
        "critical" => Ok(Severity::Critical),
        other => Err(Error::Storage(format!("unknown severity '{}'", other))),
    }
}
