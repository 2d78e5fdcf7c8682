//! Shared types and utilities for the Pulsewatch pipeline
//!
//! This crate provides the canonical metric model, error taxonomy,
//! configuration and resilience primitives used across all components of
//! the pipeline.

pub mod alert;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod forecast;
pub mod ingest;
pub mod metric;
pub mod retry;
pub mod time;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::Config;
pub use error::{Error, ErrorCode, Result};
pub use retry::{run_with_retry, RetryConfig};

pub use alert::*;
pub use forecast::*;
pub use ingest::*;
pub use metric::*;
