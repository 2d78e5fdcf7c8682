//! Dead-letter replay worker
//!
//! The host schedules `run_once` periodically; the worker claims entries
//! due for retry, replays them through the ingest path with idempotency
//! disabled, and reschedules or exhausts repeat offenders.

use crate::handler::{IngestHandler, IngestOptions};
use pulse_common::time::now_millis;
use pulse_common::{DeadLetterStatus, Result};
use pulse_store::DeadLetterStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one replay sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySweep {
    pub claimed: usize,
    pub resolved: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
}

/// Replays parked ingest failures
pub struct DeadLetterWorker {
    handler: Arc<IngestHandler>,
    store: Arc<DeadLetterStore>,
    batch_limit: usize,
}

impl DeadLetterWorker {
    pub fn new(handler: Arc<IngestHandler>, store: Arc<DeadLetterStore>) -> Self {
        Self {
            handler,
            store,
            batch_limit: 50,
        }
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    /// Claim due entries and replay them once each
    pub async fn run_once(&self) -> Result<RetrySweep> {
        let now = now_millis();
        let entries = self.store.claim_due(now, self.batch_limit).await?;
        let mut sweep = RetrySweep {
            claimed: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            let response = self
                .handler
                .ingest_with_options(
                    entry.original_request.clone(),
                    IngestOptions {
                        use_idempotency: false,
                        park_failures: false,
                    },
                )
                .await;

            if response.success {
                self.store.mark_resolved(entry.id).await?;
                sweep.resolved += 1;
                continue;
            }

            let message = response
                .errors
                .as_ref()
                .and_then(|errors| errors.first())
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "replay failed".to_string());
            match self.store.mark_failed(entry.id, &message, now_millis()).await? {
                DeadLetterStatus::Exhausted => {
                    warn!("dead-letter entry {} exhausted", entry.id);
                    sweep.exhausted += 1;
                }
                _ => sweep.rescheduled += 1,
            }
        }

        if sweep.claimed > 0 {
            info!(
                "dead-letter sweep: {} claimed, {} resolved, {} rescheduled, {} exhausted",
                sweep.claimed, sweep.resolved, sweep.rescheduled, sweep.exhausted
            );
        }
        Ok(sweep)
    }
}
