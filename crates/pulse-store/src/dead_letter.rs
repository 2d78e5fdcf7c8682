//! Dead-letter persistence for failed ingest items

use crate::metric_store::storage_err;
use crate::pool::ConnectionPool;
use pulse_common::time::{format_timestamp, parse_timestamp};
use pulse_common::{DeadLetterEntry, DeadLetterStatus, Error, IngestRequest, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Retry schedule for parked entries
#[derive(Debug, Clone)]
pub struct DeadLetterPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 3_600_000,
        }
    }
}

impl DeadLetterPolicy {
    /// Capped exponential backoff for the next attempt
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(20);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::milliseconds(delay_ms as i64)
    }
}

/// Store for dead-letter entries
pub struct DeadLetterStore {
    pool: Arc<ConnectionPool>,
    policy: DeadLetterPolicy,
}

impl DeadLetterStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            policy: DeadLetterPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DeadLetterPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &DeadLetterPolicy {
        &self.policy
    }

    /// Park a failed request for later replay
    pub async fn insert(
        &self,
        original_request: &IngestRequest,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let request_json = serde_json::to_string(original_request)?;
        let error = error.to_string();
        let next_retry = now + self.policy.delay_for(0);
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO dead_letter
                     (id, original_request, error, failed_at, retry_count, next_retry_at, status)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, 'pending')",
                    params![
                        id.to_string(),
                        request_json,
                        error,
                        format_timestamp(now),
                        format_timestamp(next_retry)
                    ],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await?;
        debug!("dead-lettered request as {}", id);
        Ok(id)
    }

    /// Claim up to `limit` pending entries due for retry, marking them
    /// `retrying` so concurrent workers do not replay the same entry.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>> {
        let now_str = format_timestamp(now);
        let rows = self
            .pool
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(storage_err)?;
                let mut claimed = Vec::new();
                {
                    let mut stmt = tx
                        .prepare(
                            "SELECT id, original_request, error, failed_at, retry_count, next_retry_at, status
                             FROM dead_letter
                             WHERE status = 'pending' AND next_retry_at <= ?1
                             ORDER BY next_retry_at ASC
                             LIMIT ?2",
                        )
                        .map_err(storage_err)?;
                    let mapped = stmt
                        .query_map(params![now_str, limit as i64], row_to_entry)
                        .map_err(storage_err)?;
                    for row in mapped {
                        claimed.push(row.map_err(storage_err)?);
                    }
                }
                for row in &claimed {
                    tx.execute(
                        "UPDATE dead_letter SET status = 'retrying' WHERE id = ?1",
                        params![row.0.clone()],
                    )
                    .map_err(storage_err)?;
                }
                tx.commit().map_err(storage_err)?;
                Ok(claimed)
            })
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.0.clone();
            match decode_entry(row) {
                Ok(mut entry) => {
                    entry.status = DeadLetterStatus::Retrying;
                    entries.push(entry);
                }
                // An undecodable row stays claimed so the sweep is not
                // poisoned by one corrupt payload.
                Err(e) => warn!("skipping undecodable dead-letter entry {}: {}", id, e),
            }
        }
        Ok(entries)
    }

    /// Mark an entry replayed successfully
    pub async fn mark_resolved(&self, id: Uuid) -> Result<()> {
        self.set_status(id, DeadLetterStatus::Resolved).await
    }

    /// Record a failed replay: schedule the next attempt with backoff, or
    /// mark the entry exhausted once retries run out.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterStatus> {
        let entry = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dead-letter entry {}", id)))?;

        let retry_count = entry.retry_count + 1;
        let (status, next_retry_at) = if retry_count >= self.policy.max_retries {
            warn!("dead-letter entry {} exhausted after {} attempts", id, retry_count);
            (DeadLetterStatus::Exhausted, now)
        } else {
            (
                DeadLetterStatus::Pending,
                now + self.policy.delay_for(retry_count),
            )
        };

        let error = error.to_string();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE dead_letter
                     SET retry_count = ?2, next_retry_at = ?3, status = ?4, error = ?5
                     WHERE id = ?1",
                    params![
                        id.to_string(),
                        retry_count,
                        format_timestamp(next_retry_at),
                        status.as_str(),
                        error
                    ],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await?;
        Ok(status)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let row = self
            .pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, original_request, error, failed_at, retry_count, next_retry_at, status
                     FROM dead_letter WHERE id = ?1",
                    params![id.to_string()],
                    row_to_entry,
                )
                .optional()
                .map_err(storage_err)
            })
            .await?;
        match row {
            Some(row) => Ok(Some(decode_entry(row)?)),
            None => Ok(None),
        }
    }

    /// Count entries in a given status
    pub async fn count_by_status(&self, status: DeadLetterStatus) -> Result<u64> {
        self.pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM dead_letter WHERE status = ?1",
                    params![status.as_str()],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as u64)
                .map_err(storage_err)
            })
            .await
    }

    async fn set_status(&self, id: Uuid, status: DeadLetterStatus) -> Result<()> {
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE dead_letter SET status = ?2 WHERE id = ?1",
                    params![id.to_string(), status.as_str()],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await
    }
}

type EntryRow = (String, String, String, String, u32, String, String);

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_entry(row: EntryRow) -> Result<DeadLetterEntry> {
    let (id, request_json, error, failed_at, retry_count, next_retry_at, status) = row;
    Ok(DeadLetterEntry {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        original_request: serde_json::from_str(&request_json)?,
        error,
        failed_at: parse_timestamp(&failed_at)?,
        retry_count,
        next_retry_at: parse_timestamp(&next_retry_at)?,
        status: DeadLetterStatus::parse(&status)
            .ok_or_else(|| Error::Storage(format!("unknown dead-letter status '{}'", status)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::schema;
    use pulse_common::time::now_millis;
    use pulse_common::IngestMetric;

    async fn test_store() -> (tempfile::TempDir, DeadLetterStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dl.db");
        let pool = Arc::new(ConnectionPool::new(PoolConfig::new(
            path.to_string_lossy().to_string(),
        )));
        pool.with_conn(|conn| schema::bootstrap(conn)).await.unwrap();
        let store = DeadLetterStore::new(pool).with_policy(DeadLetterPolicy {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
        });
        (dir, store)
    }

    fn request() -> IngestRequest {
        IngestRequest {
            tenant_id: "acme".into(),
            source_id: "collector-1".into(),
            idempotency_key: None,
            metrics: vec![IngestMetric {
                metric_key: "system.cpu.usage".into(),
                value: 42.0,
                timestamp: None,
                dimensions: None,
                tags: None,
            }],
        }
    }

    #[test]
    fn backoff_is_capped_exponential() {
        let policy = DeadLetterPolicy {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
        };
        assert_eq!(policy.delay_for(0), Duration::milliseconds(1_000));
        assert_eq!(policy.delay_for(1), Duration::milliseconds(2_000));
        assert_eq!(policy.delay_for(2), Duration::milliseconds(4_000));
        assert_eq!(policy.delay_for(3), Duration::milliseconds(5_000));
    }

    #[tokio::test]
    async fn claim_due_only_returns_ready_entries() {
        let (_dir, store) = test_store().await;
        let now = now_millis();
        let id = store.insert(&request(), "store failed", now).await.unwrap();

        // Not yet due: the first retry is base_delay in the future.
        assert!(store.claim_due(now, 10).await.unwrap().is_empty());

        let later = now + Duration::seconds(2);
        let claimed = store.claim_due(later, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, DeadLetterStatus::Retrying);

        // Claimed entries are not handed out twice.
        assert!(store.claim_due(later, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_escalate_to_exhausted() {
        let (_dir, store) = test_store().await;
        let now = now_millis();
        let id = store.insert(&request(), "boom", now).await.unwrap();

        assert_eq!(
            store.mark_failed(id, "still failing", now).await.unwrap(),
            DeadLetterStatus::Pending
        );
        assert_eq!(
            store.mark_failed(id, "still failing", now).await.unwrap(),
            DeadLetterStatus::Pending
        );
        assert_eq!(
            store.mark_failed(id, "still failing", now).await.unwrap(),
            DeadLetterStatus::Exhausted
        );
        assert_eq!(
            store.count_by_status(DeadLetterStatus::Exhausted).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn resolved_entries_leave_the_retry_queue() {
        let (_dir, store) = test_store().await;
        let now = now_millis();
        let id = store.insert(&request(), "boom", now).await.unwrap();
        store.mark_resolved(id).await.unwrap();
        let later = now + Duration::hours(1);
        assert!(store.claim_due(later, 10).await.unwrap().is_empty());
        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Resolved);
    }
}
