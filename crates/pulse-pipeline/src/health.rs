//! Health monitoring for pipeline components
//!
//! Named probes run concurrently with per-probe timeouts. Aggregation:
//! healthy when everything passes, degraded when only non-critical probes
//! fail, unhealthy otherwise. A bounded history ring feeds per-probe
//! success-rate and latency statistics.

use async_trait::async_trait;
use futures::future::join_all;
use pulse_common::config::HealthConfig;
use pulse_common::time::now_millis;
use pulse_common::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A registered health probe
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Resolve Ok when the component is healthy
    async fn probe(&self) -> Result<()>;
}

/// Adapter for closure-based probes
pub struct FnProbe<F>(pub F);

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn probe(&self) -> Result<()> {
        (self.0)().await
    }
}

/// Aggregate verdict over all probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One probe's result within a check run
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub name: String,
    pub critical: bool,
    pub healthy: bool,
    pub message: String,
    pub latency_ms: u64,
}

/// Result of one `check_all` run
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: OverallHealth,
    pub probes: Vec<ProbeOutcome>,
    pub checked_at: DateTime<Utc>,
}

/// Per-probe statistics over the retained history
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeStats {
    pub runs: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

struct ProbeEntry {
    name: String,
    critical: bool,
    probe: Arc<dyn HealthProbe>,
}

/// Registry and runner for named health probes
pub struct HealthMonitor {
    probes: RwLock<Vec<ProbeEntry>>,
    history: RwLock<VecDeque<HealthReport>>,
    probe_timeout: Duration,
    history_size: usize,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            probes: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::with_capacity(config.history_size)),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            history_size: config.history_size.max(1),
        }
    }

    /// Register a probe under a unique name
    pub async fn register(
        &self,
        name: impl Into<String>,
        critical: bool,
        probe: Arc<dyn HealthProbe>,
    ) {
        let name = name.into();
        let mut probes = self.probes.write().await;
        probes.retain(|entry| entry.name != name);
        probes.push(ProbeEntry {
            name,
            critical,
            probe,
        });
    }

    /// Run every probe concurrently and aggregate the verdict
    pub async fn check_all(&self) -> HealthReport {
        let entries: Vec<(String, bool, Arc<dyn HealthProbe>)> = {
            let probes = self.probes.read().await;
            probes
                .iter()
                .map(|e| (e.name.clone(), e.critical, e.probe.clone()))
                .collect()
        };

        let timeout = self.probe_timeout;
        let checks = entries.into_iter().map(|(name, critical, probe)| async move {
            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, probe.probe()).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            let (healthy, message) = match outcome {
                Ok(Ok(())) => (true, "ok".to_string()),
                Ok(Err(e)) => (false, e.to_string()),
                Err(_) => (false, format!("probe timed out after {:?}", timeout)),
            };
            ProbeOutcome {
                name,
                critical,
                healthy,
                message,
                latency_ms,
            }
        });
        let probes = join_all(checks).await;

        let critical_failure = probes.iter().any(|p| p.critical && !p.healthy);
        let any_failure = probes.iter().any(|p| !p.healthy);
        let overall = if critical_failure {
            OverallHealth::Unhealthy
        } else if any_failure {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        };

        for probe in probes.iter().filter(|p| !p.healthy) {
            warn!(
                "health probe '{}' failed (critical: {}): {}",
                probe.name, probe.critical, probe.message
            );
        }
        debug!("health check complete: {:?}", overall);

        let report = HealthReport {
            overall,
            probes,
            checked_at: now_millis(),
        };
        let mut history = self.history.write().await;
        if history.len() == self.history_size {
            history.pop_front();
        }
        history.push_back(report.clone());
        report
    }

    /// Success rate and average latency per probe over the retained runs
    pub async fn stats(&self) -> HashMap<String, ProbeStats> {
        let history = self.history.read().await;
        let mut stats: HashMap<String, ProbeStats> = HashMap::new();
        let mut latency_totals: HashMap<String, u64> = HashMap::new();
        for report in history.iter() {
            for probe in &report.probes {
                let entry = stats.entry(probe.name.clone()).or_default();
                entry.runs += 1;
                if probe.healthy {
                    entry.successes += 1;
                }
                *latency_totals.entry(probe.name.clone()).or_insert(0) += probe.latency_ms;
            }
        }
        for (name, entry) in stats.iter_mut() {
            entry.success_rate = entry.successes as f64 / entry.runs as f64;
            entry.avg_latency_ms =
                latency_totals.get(name).copied().unwrap_or(0) as f64 / entry.runs as f64;
        }
        stats
    }

    /// The most recent report, if any check has run
    pub async fn last_report(&self) -> Option<HealthReport> {
        self.history.read().await.back().cloned()
    }
}
