//! Named backend registry with priority and health-gated selection

use crate::backend::{BackendHealth, ForecastBackend, NoopBackend};
use pulse_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Registration options for a backend
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendRegistration {
    pub priority: i32,
    pub is_default: bool,
}

struct Entry {
    instance: Arc<dyn ForecastBackend>,
    priority: i32,
    /// Cached from the last `check_health` sweep; optimistic until then
    healthy: bool,
    last_message: String,
}

/// Keyed registry of forecast/detection backends
pub struct BackendRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    default_id: RwLock<Option<String>>,
    fallback: Arc<dyn ForecastBackend>,
    health_timeout: Duration,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_id: RwLock::new(None),
            fallback: Arc::new(NoopBackend),
            health_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Register a backend under `id`. Registering an existing id replaces
    /// the previous instance. At most one default exists at a time.
    pub async fn register(
        &self,
        id: impl Into<String>,
        instance: Arc<dyn ForecastBackend>,
        registration: BackendRegistration,
    ) {
        let id = id.into();
        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            warn!("replacing already registered backend '{}'", id);
        }
        entries.insert(
            id.clone(),
            Entry {
                instance,
                priority: registration.priority,
                healthy: true,
                last_message: "not yet checked".to_string(),
            },
        );
        drop(entries);

        if registration.is_default {
            let mut default_id = self.default_id.write().await;
            *default_id = Some(id.clone());
        }
        info!(
            "registered forecast backend '{}' (priority {}, default: {})",
            id, registration.priority, registration.is_default
        );
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ForecastBackend>> {
        self.entries.read().await.get(id).map(|e| e.instance.clone())
    }

    /// Make `id` the default backend
    pub async fn set_default(&self, id: &str) -> Result<()> {
        let entries = self.entries.read().await;
        if !entries.contains_key(id) {
            return Err(Error::NotFound(format!("backend '{}' is not registered", id)));
        }
        drop(entries);
        let mut default_id = self.default_id.write().await;
        *default_id = Some(id.to_string());
        Ok(())
    }

    /// The selection order: healthy configured default, then the
    /// highest-priority healthy backend, then the built-in noop fallback.
    pub async fn get_default(&self) -> Arc<dyn ForecastBackend> {
        let entries = self.entries.read().await;

        if let Some(default_id) = self.default_id.read().await.as_ref() {
            if let Some(entry) = entries.get(default_id) {
                if entry.healthy {
                    return entry.instance.clone();
                }
                debug!(
                    "default backend '{}' is unhealthy, falling back by priority",
                    default_id
                );
            }
        }

        let mut healthy: Vec<_> = entries.values().filter(|e| e.healthy).collect();
        healthy.sort_by_key(|e| std::cmp::Reverse(e.priority));
        match healthy.first() {
            Some(entry) => entry.instance.clone(),
            None => {
                warn!("no healthy forecast backend registered, using noop fallback");
                self.fallback.clone()
            }
        }
    }

    /// Cached health verdict for one backend, as of the last sweep
    pub async fn cached_health(&self, id: &str) -> Option<BackendHealth> {
        self.entries.read().await.get(id).map(|e| BackendHealth {
            healthy: e.healthy,
            message: e.last_message.clone(),
        })
    }

    /// Ids of backends whose cached health is good
    pub async fn list_healthy(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut ids: Vec<_> = entries
            .iter()
            .filter(|(_, e)| e.healthy)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Probe every backend concurrently with a per-probe timeout and
    /// cache the results.
    pub async fn check_health(&self) -> HashMap<String, BackendHealth> {
        let snapshot: Vec<(String, Arc<dyn ForecastBackend>)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .map(|(id, e)| (id.clone(), e.instance.clone()))
                .collect()
        };

        let timeout = self.health_timeout;
        let probes = snapshot.into_iter().map(|(id, instance)| async move {
            let health = match tokio::time::timeout(timeout, instance.check_health()).await {
                Ok(health) => health,
                Err(_) => BackendHealth::unhealthy(format!(
                    "health probe timed out after {:?}",
                    timeout
                )),
            };
            (id, health)
        });
        let results: HashMap<String, BackendHealth> =
            futures::future::join_all(probes).await.into_iter().collect();

        let mut entries = self.entries.write().await;
        for (id, health) in &results {
            if let Some(entry) = entries.get_mut(id) {
                if entry.healthy && !health.healthy {
                    warn!("backend '{}' became unhealthy: {}", id, health.message);
                }
                entry.healthy = health.healthy;
                entry.last_message = health.message.clone();
            }
        }
        results
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
