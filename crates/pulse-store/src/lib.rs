//! Pooled SQLite persistence for the Pulsewatch pipeline
//!
//! The connection pool is the sole reader/writer surface for the database;
//! every store in this crate borrows handles from it and returns them
//! before yielding control back to callers.

pub mod alert_store;
pub mod dead_letter;
pub mod forecast_store;
pub mod idempotency;
pub mod metric_store;
pub mod pool;
pub mod schema;

pub use alert_store::{AlertStore, TenantAlertStats};
pub use dead_letter::{DeadLetterPolicy, DeadLetterStore};
pub use forecast_store::ForecastStore;
pub use idempotency::IdempotencyStore;
pub use metric_store::{MetricQuery, MetricStore, StoreBatchOutcome};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use schema::bootstrap;
