//! Idempotency record persistence

use crate::metric_store::storage_err;
use crate::pool::ConnectionPool;
use pulse_common::time::{format_timestamp, parse_timestamp};
use pulse_common::{IdempotencyRecord, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Store for request replay records
pub struct IdempotencyStore {
    pool: Arc<ConnectionPool>,
}

impl IdempotencyStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Fetch an unexpired record for `key`
    pub async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<IdempotencyRecord>> {
        let key = key.to_string();
        let now_str = format_timestamp(now);
        let row: Option<(String, String, String, String, String)> = self
            .pool
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT key, request_id, created_at, expires_at, original_response
                     FROM idempotency_keys WHERE key = ?1 AND expires_at > ?2",
                    params![key, now_str],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(storage_err)
            })
            .await?;

        match row {
            None => Ok(None),
            Some((key, request_id, created_at, expires_at, original_response)) => {
                Ok(Some(IdempotencyRecord {
                    key,
                    request_id: Uuid::parse_str(&request_id)
                        .unwrap_or_else(|_| Uuid::nil()),
                    created_at: parse_timestamp(&created_at)?,
                    expires_at: parse_timestamp(&expires_at)?,
                    original_response,
                }))
            }
        }
    }

    /// Persist a replay record, replacing any stale row under the same key
    pub async fn put(&self, record: &IdempotencyRecord) -> Result<()> {
        let record = record.clone();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO idempotency_keys
                     (key, request_id, created_at, expires_at, original_response)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        record.key,
                        record.request_id.to_string(),
                        format_timestamp(record.created_at),
                        format_timestamp(record.expires_at),
                        record.original_response
                    ],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await
    }

    /// Delete expired records; returns how many were removed
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_str = format_timestamp(now);
        let removed = self
            .pool
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM idempotency_keys WHERE expires_at <= ?1",
                    params![now_str],
                )
                .map_err(storage_err)
            })
            .await?;
        if removed > 0 {
            debug!("removed {} expired idempotency record(s)", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::schema;
    use chrono::Duration;
    use pulse_common::time::now_millis;

    async fn test_store() -> (tempfile::TempDir, IdempotencyStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idem.db");
        let pool = Arc::new(ConnectionPool::new(PoolConfig::new(
            path.to_string_lossy().to_string(),
        )));
        pool.with_conn(|conn| schema::bootstrap(conn)).await.unwrap();
        (dir, IdempotencyStore::new(pool))
    }

    fn record(key: &str, ttl_hours: i64) -> IdempotencyRecord {
        let now = now_millis();
        IdempotencyRecord {
            key: key.into(),
            request_id: Uuid::new_v4(),
            created_at: now,
            expires_at: now + Duration::hours(ttl_hours),
            original_response: r#"{"success":true,"accepted":1}"#.into(),
        }
    }

    #[tokio::test]
    async fn stored_response_is_returned_byte_equal() {
        let (_dir, store) = test_store().await;
        let rec = record("k-1", 24);
        store.put(&rec).await.unwrap();

        let found = store.get("k-1", now_millis()).await.unwrap().unwrap();
        assert_eq!(found.original_response, rec.original_response);
        assert_eq!(found.request_id, rec.request_id);
    }

    #[tokio::test]
    async fn expired_records_are_invisible_and_cleaned() {
        let (_dir, store) = test_store().await;
        let rec = record("k-2", -1);
        store.put(&rec).await.unwrap();

        assert!(store.get("k-2", now_millis()).await.unwrap().is_none());
        assert_eq!(store.cleanup_expired(now_millis()).await.unwrap(), 1);
        assert_eq!(store.cleanup_expired(now_millis()).await.unwrap(), 0);
    }
}
