//! Batch ingest pipeline
//!
//! validate -> idempotency check -> tenant upsert -> normalize -> store ->
//! dead-letter failures -> respond. The handler never returns an error to
//! the caller; anything unclassified lands in the response as
//! `internal_error`.

use crate::normalizer::Normalizer;
use pulse_common::config::IngestConfig;
use pulse_common::time::now_millis;
use pulse_common::{
    ErrorCode, IdempotencyRecord, IngestMetric, IngestRequest, IngestResponse, ItemError,
};
use pulse_store::{DeadLetterStore, IdempotencyStore, MetricStore};
use chrono::Duration;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-call ingest options
#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    /// Backfill and dead-letter replays run with idempotency disabled
    pub use_idempotency: bool,
    /// Dead-letter replays disable parking so a failing entry is
    /// rescheduled in place instead of duplicated
    pub park_failures: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            use_idempotency: true,
            park_failures: true,
        }
    }
}

/// Webhook-shaped batch ingest handler
pub struct IngestHandler {
    metric_store: Arc<MetricStore>,
    idempotency: Arc<IdempotencyStore>,
    dead_letter: Arc<DeadLetterStore>,
    normalizer: Normalizer,
    config: IngestConfig,
}

impl IngestHandler {
    pub fn new(
        metric_store: Arc<MetricStore>,
        idempotency: Arc<IdempotencyStore>,
        dead_letter: Arc<DeadLetterStore>,
        config: IngestConfig,
    ) -> Self {
        let normalizer = Normalizer::new(config.pipeline_version.clone());
        Self {
            metric_store,
            idempotency,
            dead_letter,
            normalizer,
            config,
        }
    }

    /// Ingest a batch with idempotency enabled
    pub async fn ingest(&self, request: IngestRequest) -> IngestResponse {
        self.ingest_with_options(request, IngestOptions::default())
            .await
    }

    /// Ingest a batch with explicit options
    pub async fn ingest_with_options(
        &self,
        request: IngestRequest,
        options: IngestOptions,
    ) -> IngestResponse {
        let started = Instant::now();
        let request_id = Uuid::new_v4();

        // 1. Envelope validation: a structurally invalid envelope fails the
        // whole request with per-item errors.
        if let Some(message) = validate_envelope(&request) {
            warn!("rejecting ingest envelope: {}", message);
            return finish(
                IngestResponse {
                    success: false,
                    request_id,
                    accepted: 0,
                    rejected: request.metrics.len(),
                    duration_ms: 0,
                    errors: Some(envelope_errors(&request, &message)),
                },
                started,
            );
        }

        // 2. Idempotent replay returns the originally computed response.
        let effective_key = effective_idempotency_key(&request);
        if options.use_idempotency {
            match self.idempotency.get(&effective_key, now_millis()).await {
                Ok(Some(record)) => {
                    debug!(
                        "idempotency hit for key '{}', replaying request {}",
                        effective_key, record.request_id
                    );
                    match serde_json::from_str::<IngestResponse>(&record.original_response) {
                        Ok(original) => return original,
                        Err(e) => {
                            // A corrupt record must not fail the request;
                            // fall through and reprocess.
                            error!("stored idempotency response is unreadable: {}", e);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("idempotency lookup failed, continuing: {}", e),
            }
        }

        // 3. Tenant row must exist before points reference it.
        if let Err(e) = self.metric_store.ensure_tenant(&request.tenant_id).await {
            error!("tenant upsert failed: {}", e);
            return finish(
                IngestResponse {
                    success: false,
                    request_id,
                    accepted: 0,
                    rejected: request.metrics.len(),
                    duration_ms: 0,
                    errors: Some(vec![ItemError {
                        index: 0,
                        metric_key: None,
                        code: e.wire_code(),
                        message: e.to_string(),
                    }]),
                },
                started,
            );
        }

        // 4. Normalize into canonical records.
        let batch =
            self.normalizer
                .normalize_batch(&request.tenant_id, &request.source_id, &request.metrics);
        let mut errors = batch.rejected.clone();
        let mut accepted_points = batch.accepted;

        // 5. Store in chunks with duplicate coalescing. A storage failure
        // rejects the affected points but never aborts the batch.
        let mut stored = 0usize;
        if !accepted_points.is_empty() {
            let points: Vec<_> = accepted_points.iter().map(|a| a.point.clone()).collect();
            match self.metric_store.store_batch(&points).await {
                Ok(outcome) => {
                    stored = accepted_points.len();
                    if outcome.duplicates > 0 {
                        debug!("coalesced {} duplicate point(s)", outcome.duplicates);
                    }
                }
                Err(e) => {
                    error!("metric store batch failed: {}", e);
                    for accepted in accepted_points.drain(..) {
                        errors.push(ItemError {
                            index: accepted.index,
                            metric_key: Some(accepted.point.metric_key.clone()),
                            code: e.wire_code(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        // 6. Dead-letter the first K failures for later replay.
        if options.park_failures {
            self.dead_letter_failures(&request, &errors).await;
        }

        errors.sort_by_key(|e| e.index);
        let response = IngestResponse {
            success: errors.is_empty(),
            request_id,
            accepted: stored,
            rejected: errors.len(),
            duration_ms: started.elapsed().as_millis() as u64,
            errors: if errors.is_empty() { None } else { Some(errors) },
        };

        // 7. Persist the replay record only for caller-supplied keys.
        if options.use_idempotency && request.idempotency_key.is_some() {
            self.persist_idempotency(&effective_key, &response).await;
        }

        info!(
            "ingest {}: {} accepted, {} rejected in {}ms",
            response.request_id, response.accepted, response.rejected, response.duration_ms
        );
        response
    }

    async fn dead_letter_failures(&self, request: &IngestRequest, errors: &[ItemError]) {
        let now = now_millis();
        for item_error in errors.iter().take(self.config.dead_letter_limit) {
            let Some(item) = request.metrics.get(item_error.index) else {
                continue;
            };
            let single = single_item_request(request, item.clone());
            if let Err(e) = self
                .dead_letter
                .insert(&single, &item_error.message, now)
                .await
            {
                warn!("failed to dead-letter item {}: {}", item_error.index, e);
            }
        }
        if errors.len() > self.config.dead_letter_limit {
            warn!(
                "dead-lettered only the first {} of {} failed items",
                self.config.dead_letter_limit,
                errors.len()
            );
        }
    }

    async fn persist_idempotency(&self, key: &str, response: &IngestResponse) {
        let serialized = match serde_json::to_string(response) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to serialize response for idempotency record: {}", e);
                return;
            }
        };
        let now = now_millis();
        let record = IdempotencyRecord {
            key: key.to_string(),
            request_id: response.request_id,
            created_at: now,
            expires_at: now + Duration::hours(self.config.idempotency_ttl_hours),
            original_response: serialized,
        };
        if let Err(e) = self.idempotency.put(&record).await {
            warn!("failed to persist idempotency record '{}': {}", key, e);
        }
    }
}

/// The effective idempotency key: the caller's, or one derived from the
/// request identity so byte-identical retries coalesce.
pub fn effective_idempotency_key(request: &IngestRequest) -> String {
    match &request.idempotency_key {
        Some(key) => format!("{}:{}", request.tenant_id, key),
        None => format!(
            "{}:{}:{:016x}",
            request.tenant_id,
            request.source_id,
            stable_hash(&request.metrics)
        ),
    }
}

/// Order-sensitive stable hash of the raw items
fn stable_hash(items: &[IngestMetric]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for item in items {
        item.metric_key.hash(&mut hasher);
        item.value.to_bits().hash(&mut hasher);
        item.timestamp.hash(&mut hasher);
        if let Some(dims) = &item.dimensions {
            let mut keys: Vec<_> = dims.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(&mut hasher);
                dims[key].to_string().hash(&mut hasher);
            }
        }
        item.tags.hash(&mut hasher);
    }
    hasher.finish()
}

fn validate_envelope(request: &IngestRequest) -> Option<String> {
    if request.tenant_id.trim().is_empty() {
        return Some("tenant_id must be non-empty".to_string());
    }
    if request.source_id.trim().is_empty() {
        return Some("source_id must be non-empty".to_string());
    }
    None
}

fn envelope_errors(request: &IngestRequest, message: &str) -> Vec<ItemError> {
    if request.metrics.is_empty() {
        return vec![ItemError {
            index: 0,
            metric_key: None,
            code: ErrorCode::SchemaValidationFailed,
            message: message.to_string(),
        }];
    }
    request
        .metrics
        .iter()
        .enumerate()
        .map(|(index, item)| ItemError {
            index,
            metric_key: Some(item.metric_key.clone()),
            code: ErrorCode::SchemaValidationFailed,
            message: message.to_string(),
        })
        .collect()
}

fn single_item_request(request: &IngestRequest, item: IngestMetric) -> IngestRequest {
    IngestRequest {
        tenant_id: request.tenant_id.clone(),
        source_id: request.source_id.clone(),
        idempotency_key: None,
        metrics: vec![item],
    }
}

fn finish(mut response: IngestResponse, started: Instant) -> IngestResponse {
    response.duration_ms = started.elapsed().as_millis() as u64;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_store::{ConnectionPool, PoolConfig};

    async fn test_handler() -> (tempfile::TempDir, IngestHandler) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.db");
        let pool = Arc::new(ConnectionPool::new(PoolConfig::new(
            path.to_string_lossy().to_string(),
        )));
        pool.with_conn(|conn| pulse_store::bootstrap(conn))
            .await
            .unwrap();
        let handler = IngestHandler::new(
            Arc::new(MetricStore::new(pool.clone())),
            Arc::new(IdempotencyStore::new(pool.clone())),
            Arc::new(DeadLetterStore::new(pool.clone())),
            IngestConfig::default(),
        );
        (dir, handler)
    }

    fn request_with_key(key: Option<&str>) -> IngestRequest {
        IngestRequest {
            tenant_id: "T".into(),
            source_id: "S".into(),
            idempotency_key: key.map(|k| k.to_string()),
            metrics: vec![IngestMetric {
                metric_key: "system.cpu.usage".into(),
                value: 42.0,
                timestamp: Some("2025-01-01T00:00:00.000Z".into()),
                dimensions: None,
                tags: None,
            }],
        }
    }

    #[tokio::test]
    async fn idempotent_replay_returns_original_response() {
        let (_dir, handler) = test_handler().await;
        let first = handler.ingest(request_with_key(Some("K"))).await;
        assert!(first.success);
        assert_eq!(first.accepted, 1);
        assert_eq!(first.rejected, 0);

        let second = handler.ingest(request_with_key(Some("K"))).await;
        assert_eq!(first, second);

        // Exactly one row in the store.
        assert_eq!(handler.metric_store.count("T").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn keyless_requests_do_not_persist_replay_records() {
        let (_dir, handler) = test_handler().await;
        let first = handler.ingest(request_with_key(None)).await;
        let second = handler.ingest(request_with_key(None)).await;
        // Each call is processed on its own; the identity tuple still
        // coalesces the duplicate point.
        assert_ne!(first.request_id, second.request_id);
        assert_eq!(handler.metric_store.count("T").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_envelope_fails_with_item_errors() {
        let (_dir, handler) = test_handler().await;
        let mut request = request_with_key(None);
        request.tenant_id = "".into();
        let response = handler.ingest(request).await;
        assert!(!response.success);
        assert_eq!(response.rejected, 1);
        let errors = response.errors.unwrap();
        assert_eq!(errors[0].code, ErrorCode::SchemaValidationFailed);
    }

    #[tokio::test]
    async fn item_failures_are_collected_and_dead_lettered() {
        let (_dir, handler) = test_handler().await;
        let mut request = request_with_key(None);
        request.metrics.push(IngestMetric {
            metric_key: "bad key!".into(),
            value: 1.0,
            timestamp: None,
            dimensions: None,
            tags: None,
        });
        request.metrics.push(IngestMetric {
            metric_key: "system.load".into(),
            value: f64::NAN,
            timestamp: None,
            dimensions: None,
            tags: None,
        });

        let response = handler.ingest(request).await;
        assert!(!response.success);
        assert_eq!(response.accepted, 1);
        assert_eq!(response.rejected, 2);
        let errors = response.errors.unwrap();
        assert_eq!(errors[0].index, 1);
        assert_eq!(errors[0].code, ErrorCode::InvalidMetricKey);
        assert_eq!(errors[1].index, 2);
        assert_eq!(errors[1].code, ErrorCode::InvalidValue);

        assert_eq!(
            handler
                .dead_letter
                .count_by_status(pulse_common::DeadLetterStatus::Pending)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn derived_keys_are_stable_per_request_identity() {
        let a = request_with_key(None);
        let b = request_with_key(None);
        assert_eq!(effective_idempotency_key(&a), effective_idempotency_key(&b));

        let mut c = request_with_key(None);
        c.metrics[0].value = 43.0;
        assert_ne!(effective_idempotency_key(&a), effective_idempotency_key(&c));
    }
}
