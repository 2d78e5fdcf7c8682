//! Ingest envelope, response and dead-letter shapes

use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A single inbound metric item, pre-normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestMetric {
    pub metric_key: String,
    pub value: f64,
    /// ISO-8601 instant; defaults to receipt time when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Open map validated into canonical dimensions by the normalizer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// Webhook-shaped batch ingest envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub tenant_id: String,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub metrics: Vec<IngestMetric>,
}

/// Per-item error reported back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_key: Option<String>,
    pub code: ErrorCode,
    pub message: String,
}

/// Response for a batch ingest request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    pub request_id: Uuid,
    pub accepted: usize,
    pub rejected: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ItemError>>,
}

/// Stored replay record for an idempotent request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// The original response, byte-preserved as serialized JSON
    pub original_response: String,
}

/// Lifecycle status of a dead-letter entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    Retrying,
    Exhausted,
    Resolved,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Retrying => "retrying",
            DeadLetterStatus::Exhausted => "exhausted",
            DeadLetterStatus::Resolved => "resolved",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(DeadLetterStatus::Pending),
            "retrying" => Some(DeadLetterStatus::Retrying),
            "exhausted" => Some(DeadLetterStatus::Exhausted),
            "resolved" => Some(DeadLetterStatus::Resolved),
            _ => None,
        }
    }
}

/// A failed ingest item parked for later replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub original_request: IngestRequest,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub status: DeadLetterStatus,
}
