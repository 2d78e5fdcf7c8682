//! Ingest path for the Pulsewatch pipeline
//!
//! Validates webhook-shaped batches, deduplicates whole requests through
//! idempotency records, normalizes points into canonical records, stores
//! them with per-point coalescing, and parks failures in the dead-letter
//! queue for scheduled replay.

pub mod backfill;
pub mod handler;
pub mod normalizer;
pub mod retry_worker;

pub use backfill::{BackfillRunner, BackfillSummary};
pub use handler::{effective_idempotency_key, IngestHandler, IngestOptions};
pub use normalizer::{canonicalize_dimension_key, canonicalize_metric_key, Normalizer};
pub use retry_worker::{DeadLetterWorker, RetrySweep};
